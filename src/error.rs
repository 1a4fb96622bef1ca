use std::net::SocketAddr;

use snafu::{Location, Snafu};

use crate::database::DatabaseError;
use crate::predict::ArtifactError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ApplicationError {
    /// could not parse the configuration from the environment
    #[snafu(display("invalid `{prefix}*` configuration: {source}"))]
    ConfigLoad {
        prefix: &'static str,
        source: envy::Error,
        #[snafu(implicit)]
        location: Location,
    },

    /// At least one API key is needed to talk to YouTube
    #[snafu(display("no YouTube API keys configured, set YOUTUBE_API_KEYS"))]
    MissingApiKeys {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("cannot connect to the database: {source}"))]
    ConnectDatabase {
        source: DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },

    /// A model artifact exists but could not be loaded
    #[snafu(display("cannot load the prediction models: {source}"))]
    LoadModels {
        source: ArtifactError,
        #[snafu(implicit)]
        location: Location,
    },

    /// Could not serve the application
    #[snafu(display("web server stopped: {source}"))]
    WebServer {
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    /// Could not bind to the given address, check if it's already in use
    #[snafu(display("cannot bind to {address}: {source}"))]
    BindAddress {
        address: SocketAddr,
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    /// Could not initialize the logger
    #[snafu(display("cannot initialize the logger: {source}"))]
    InitializeLogger {
        source: tracing::subscriber::SetGlobalDefaultError,
        #[snafu(implicit)]
        location: Location,
    },
}
