use serde::de::DeserializeOwned;
use snafu::{OptionExt as _, ResultExt as _};
use surrealdb::opt::QueryResult;

use super::*;

/// A query under construction. Parameters can be bound using the [Bindings::bind] method which takes
/// any serializable data structure.
///
/// # Example
/// ```text
/// let videos: Vec<Video> = database.sql("SELECT * FROM videos WHERE channel_id = $channel")
///     .bind(("channel", channel_id))
///     .fetch_first()
///     .await?;
/// ```
#[derive(Debug)]
pub struct Bindings<'a> {
    query: surrealdb::method::Query<'a, Any>,
}

impl<'a> Bindings<'a> {
    pub(super) fn new(query: surrealdb::method::Query<'a, Any>) -> Self {
        Self { query }
    }

    pub fn bind(mut self, params: impl serde::Serialize) -> Self {
        let query = self.query;
        self.query = query.bind(params);
        self
    }

    /// Execute the query and return a [surrealdb::Response] which is SurrealDB's way to represent
    /// a list of statements returned from the database.
    ///
    /// A statement that failed inside the database is reported as an error here.
    pub async fn execute(self) -> Result<surrealdb::Response> {
        let response = self
            .query
            .await
            .context(MalformedQuerySnafu)?
            .check()
            .context(MalformedQuerySnafu)?;
        tracing::trace!(?response, "executed query");
        Ok(response)
    }

    /// Execute the query and return the first statement's result as a deserialized value.
    pub async fn fetch_first<T: DeserializeOwned>(self) -> Result<T>
    where
        usize: QueryResult<T>,
    {
        let mut statements = self.execute().await?;
        let result = statements.take::<T>(0).context(DeserializeSnafu)?;
        Ok(result)
    }

    /// Like [Bindings::fetch_first] but fails when the statement returned nothing.
    pub async fn fetch_one<T: DeserializeOwned>(self) -> Result<T>
    where
        usize: QueryResult<Option<T>>,
    {
        self.fetch_first::<Option<T>>()
            .await?
            .context(NoResultsSnafu)
    }
}
