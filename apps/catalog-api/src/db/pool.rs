use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

pub type DbPool = Pool<AsyncPgConnection>;

/// Upper bound on pooled query connections. The LISTEN connection is not
/// part of the pool.
const POOL_MAX_SIZE: usize = 20;

/// Create the Diesel async connection pool used by the read path.
///
/// Connections are opened lazily, so this succeeds even while the database
/// is down; the first query reports the failure instead.
pub fn connect(database_url: &str) -> DbPool {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager)
        .max_size(POOL_MAX_SIZE)
        .build()
        .expect("failed to build connection pool");

    tracing::info!(max_size = POOL_MAX_SIZE, "database pool created");

    pool
}
