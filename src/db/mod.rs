// Durable storage backed by Postgres
pub mod postgres;

pub use postgres::PostgresStore;
