//! Bounded async connection pooling.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use callguard::config::PoolConfig;
//! use callguard::pool::{ManageConnection, Pool};
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl ManageConnection for Counter {
//!     type Connection = String;
//!
//!     async fn create(&self) -> callguard::Result<String> {
//!         Ok("conn".to_string())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let pool = Pool::new(Counter, PoolConfig::default()).await.unwrap();
//! let conn = pool.acquire().await.unwrap();
//! assert_eq!(conn.as_str(), "conn");
//! pool.release(conn).await;
//! assert_eq!(pool.state().idle, 2);
//! # });
//! ```

pub mod manager;
pub mod resource_pool;

pub use manager::ManageConnection;
pub use resource_pool::{Pool, PoolState, PooledConnection};
