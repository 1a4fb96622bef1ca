use chrono::Duration;
use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::define_relation;

pub use channel::*;
pub use prediction::*;
pub use snapshot::*;
pub use timestamp::*;
pub use video::*;
pub use video_id::*;

mod channel;
mod prediction;
mod snapshot;
mod timestamp;
mod video;
mod video_id;
