//! Database connectivity, introspection and query execution.

mod connection;
pub mod driver;
pub mod query;
pub mod schema;
pub mod types;

pub use connection::{build_tiberius_config, TdsConnector, TdsPool};
pub use driver::{Connector, FaultSignal, PoolOptions, SqlPool, StatementOutput};
pub use query::{QueryExecutor, QueryResult, ResultRow, StatementKind};
pub use schema::{
    CatalogMode, ColumnSchema, SchemaCatalog, SchemaDocument, SchemaIntrospector, TableSchema,
};
pub use types::{SqlValue, TypeMapper};
