use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use snafu::{Location, ResultExt as _, Snafu};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use url::Url;

use crate::model::{Timestamp, VideoId};

/// Helper for executing arbitrary SurrealQL queries.
pub mod query;

/// Macros for defining table methods.
pub mod macros;

pub use query::Bindings;

pub type Result<T, E = DatabaseError> = std::result::Result<T, E>;

const SETUP: &str = include_str!("../../schema.surrealql");

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DatabaseError {
    #[snafu(display("cannot connect to the database `{url}`: {source}"))]
    Connection {
        url: String,
        source: surrealdb::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("failed to apply the database schema: {source}"))]
    Setup {
        source: surrealdb::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("failed to query the database: {source}"))]
    MalformedQuery {
        source: surrealdb::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("failed to deserialize the database response: {source}"))]
    Deserialize {
        source: surrealdb::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("expected a result but the query returned nothing"))]
    NoResults {
        #[snafu(implicit)]
        location: Location,
    },

    /// Snapshots of a video must be appended in strictly increasing capture order.
    #[snafu(display(
        "snapshot of `{video_id}` captured at {captured_at} is not newer than the latest one ({latest})"
    ))]
    OutOfOrderSnapshot {
        video_id: VideoId,
        captured_at: Timestamp,
        latest: Timestamp,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: Url,
    #[serde(default = "default_name")]
    pub namespace: String,
    #[serde(default = "default_name")]
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_name() -> String {
    "viewtrends".to_string()
}

impl DatabaseConfig {
    fn credentials(&self) -> Option<impl auth::Credentials<auth::Signin, auth::Jwt> + '_> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref()?;

        Some(auth::Database {
            namespace: &self.namespace,
            database: &self.database,
            username,
            password,
        })
    }
}

/// Handle to the persistence store.
///
/// Cloning is cheap; clones share the connection and the per-video append locks.
#[derive(Debug, Clone)]
pub struct Database {
    database: Surreal<Any>,
    appends: Arc<DashMap<VideoId, Arc<Mutex<()>>>>,
}

impl Database {
    #[tracing::instrument(skip(config), fields(url = %config.url))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config.url.as_str();

        let database = surrealdb::engine::any::connect(url)
            .await
            .context(ConnectionSnafu { url })?;

        if let Some(credentials) = config.credentials() {
            database
                .signin(credentials)
                .await
                .context(ConnectionSnafu { url })?;
        }

        database
            .use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .context(ConnectionSnafu { url })?;

        Self::setup(database).await
    }

    /// A fresh in-memory database, used for local runs and tests.
    pub async fn memory() -> Result<Self> {
        let config = DatabaseConfig {
            url: Url::parse("mem://").expect("static url is valid"),
            namespace: default_name(),
            database: default_name(),
            username: None,
            password: None,
        };

        Self::connect(&config).await
    }

    async fn setup(database: Surreal<Any>) -> Result<Self> {
        database
            .query(SETUP)
            .await
            .context(SetupSnafu)?
            .check()
            .context(SetupSnafu)?;

        tracing::info!("database schema applied");

        Ok(Self {
            database,
            appends: Arc::default(),
        })
    }

    /// Create a builder to execute arbitrary SurrealQL on the database.
    pub fn sql(&self, query: &str) -> Bindings<'_> {
        Bindings::new(self.database.query(query))
    }

    /// The lock serializing snapshot appends of one video.
    pub(crate) fn append_lock(&self, video_id: &VideoId) -> Arc<Mutex<()>> {
        self.appends
            .entry(video_id.clone())
            .or_default()
            .value()
            .clone()
    }
}

impl std::ops::Deref for Database {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.database
    }
}
