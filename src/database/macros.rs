/// Defines a method to query the database using SurrealQL.
///
/// # Syntax
/// ```text
/// [Base Type] > method_name(...arguments) > [Output Type] where "sql query"
/// ```
/// Where the `Base Type` is the type that the method is being defined for and the `Output Type` is
/// what the first statement of the query deserializes into (`Vec<T>` or `Option<T>`). Every argument
/// is bound under its own name.
///
/// # Example
///
/// ```text
/// define_relation! {
///     Snapshot > history(video: VideoId) > Vec<Snapshot>
///         where "SELECT * FROM snapshots WHERE video_id = $video ORDER BY seq ASC"
/// }
///
/// let history = Snapshot::history(video_id, &db).await?;
/// ```
#[macro_export]
macro_rules! define_relation {
    ($model:ty > $relation:ident ($($binding:ident : $binding_type:ty),*) > $export:ty where $query:literal) => {
        impl $model {
            #[tracing::instrument(level = "debug", skip(db))]
            pub async fn $relation(
                $($binding : $binding_type ,)* db: &$crate::database::Database,
            ) -> $crate::database::Result<$export> {
                db.sql($query)
                    $(.bind((stringify!($binding), $binding)))*
                    .fetch_first()
                    .await
            }
        }
    };
}
