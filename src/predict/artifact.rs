//! Versioned gradient-boosted tree ensembles stored as JSON, one file per size class.
//!
//! ```json
//! {
//!   "version": "short-2024.03.1",
//!   "size_class": "short",
//!   "transform": "log1p",
//!   "horizons": [
//!     { "hours": 1, "base_score": 4.2, "trees": [
//!       { "nodes": [
//!         { "feature": "view_velocity", "threshold": 120.0, "left": 1, "right": 2 },
//!         { "leaf": -0.3 },
//!         { "leaf": 0.8 }
//!       ] }
//!     ] }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ensure, Location, ResultExt as _, Snafu};

use crate::features::FeatureVector;
use crate::model::{Horizon, SizeClass, DEFAULT_HORIZONS};

pub type Result<T, E = ArtifactError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ArtifactError {
    #[snafu(display("cannot read model artifact {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("model artifact {} is not valid JSON: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("model artifact {} is invalid: {message}", path.display()))]
    Invalid {
        path: PathBuf,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
}

/// How raw ensemble output maps back to a view count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    #[default]
    Identity,
    /// The ensemble was fit on `ln(1 + views)`.
    Log1p,
}

impl Transform {
    fn apply(self, raw: f64) -> f64 {
        match self {
            Transform::Identity => raw,
            Transform::Log1p => raw.exp_m1(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Split {
        feature: String,
        threshold: f64,
        left: usize,
        right: usize,
        /// Branch taken when the feature is absent from the vector.
        #[serde(default)]
        missing_left: bool,
    },
    Leaf {
        leaf: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    /// Children always point forward, so evaluation terminates.
    fn evaluate(&self, features: &FeatureVector) -> f64 {
        let mut index = 0;

        loop {
            match &self.nodes[index] {
                Node::Leaf { leaf } => return *leaf,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    missing_left,
                } => {
                    let go_left = match features.get(feature) {
                        Some(value) => value < *threshold,
                        None => *missing_left,
                    };
                    index = if go_left { *left } else { *right };
                }
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree without nodes".to_string());
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if let Node::Split {
                left,
                right,
                threshold,
                ..
            } = node
            {
                for child in [*left, *right] {
                    if child <= index || child >= self.nodes.len() {
                        return Err(format!("node {index} points to invalid child {child}"));
                    }
                }
                if !threshold.is_finite() {
                    return Err(format!("node {index} has a non-finite threshold"));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ensemble {
    pub hours: u32,
    #[serde(default)]
    pub base_score: f64,
    #[serde(default)]
    pub trees: Vec<Tree>,
}

impl Ensemble {
    fn raw(&self, features: &FeatureVector) -> f64 {
        self.base_score
            + self
                .trees
                .iter()
                .map(|tree| tree.evaluate(features))
                .sum::<f64>()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ArtifactFile {
    version: String,
    size_class: SizeClass,
    #[serde(default)]
    transform: Transform,
    horizons: Vec<Ensemble>,
}

/// A loaded, validated artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    version: String,
    size_class: SizeClass,
    transform: Transform,
    ensembles: BTreeMap<Horizon, Ensemble>,
}

impl Artifact {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    pub fn horizons(&self) -> impl Iterator<Item = Horizon> + '_ {
        self.ensembles.keys().copied()
    }

    /// Raw model output for `offset`, before clamping. Offsets without their own ensemble use
    /// the nearest shorter one.
    pub fn evaluate(&self, features: &FeatureVector, offset: Horizon) -> f64 {
        let ensemble = self
            .ensembles
            .range(..=offset)
            .next_back()
            .or_else(|| self.ensembles.iter().next())
            .map(|(_, ensemble)| ensemble);

        match ensemble {
            Some(ensemble) => self.transform.apply(ensemble.raw(features)),
            None => 0.0,
        }
    }

    pub fn load(path: &Path, expected: SizeClass) -> Result<Self> {
        let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::parse(&text, path, expected)
    }

    pub fn parse(text: &str, path: &Path, expected: SizeClass) -> Result<Self> {
        let file: ArtifactFile = serde_json::from_str(text).context(ParseSnafu { path })?;

        let invalid = |message: String| InvalidSnafu { path, message }.build();

        ensure!(
            !file.version.trim().is_empty(),
            InvalidSnafu {
                path,
                message: "empty version"
            }
        );
        ensure!(
            file.size_class == expected,
            InvalidSnafu {
                path,
                message: format!("artifact is for {} videos, expected {expected}", file.size_class)
            }
        );

        let mut ensembles = BTreeMap::new();
        for ensemble in file.horizons {
            if ensemble.hours == 0 {
                return Err(invalid("horizon of 0 hours".to_string()));
            }
            if !ensemble.base_score.is_finite() {
                return Err(invalid(format!("{}h base score is not finite", ensemble.hours)));
            }
            for (index, tree) in ensemble.trees.iter().enumerate() {
                tree.validate()
                    .map_err(|message| invalid(format!("{}h tree {index}: {message}", ensemble.hours)))?;
            }

            let horizon = Horizon::hours(ensemble.hours);
            if ensembles.insert(horizon, ensemble).is_some() {
                return Err(invalid(format!("duplicate horizon {}h", horizon.hours)));
            }
        }

        let covered: BTreeSet<Horizon> = ensembles.keys().copied().collect();
        let missing: Vec<String> = DEFAULT_HORIZONS
            .iter()
            .filter(|horizon| !covered.contains(horizon))
            .map(|horizon| format!("{}h", horizon.hours))
            .collect();
        if !missing.is_empty() {
            return Err(invalid(format!("no ensemble for {}", missing.join(", "))));
        }

        Ok(Self {
            version: file.version,
            size_class: file.size_class,
            transform: file.transform,
            ensembles,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// An artifact whose every horizon predicts `value` views.
    pub fn constant(size_class: SizeClass, value: f64) -> Artifact {
        let horizons: Vec<_> = DEFAULT_HORIZONS
            .iter()
            .map(|horizon| serde_json::json!({ "hours": horizon.hours, "base_score": value }))
            .collect();

        let text = serde_json::json!({
            "version": format!("{size_class}-constant"),
            "size_class": size_class,
            "horizons": horizons,
        })
        .to_string();

        Artifact::parse(&text, Path::new("constant.json"), size_class).unwrap()
    }
}
