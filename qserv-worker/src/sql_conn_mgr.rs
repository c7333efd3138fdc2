//! `SqlConnMgr`: bounds the number of concurrently executing Tasks' MySQL
//! connections (spec.md section 4.6 step 1, "Wait for a MySQL connection
//! slot from SqlConnMgr (bounded)"; section 5, "MySQL calls are treated as
//! blocking and therefore must occur only on pool threads").

use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

pub struct SqlConnMgr {
    semaphore: Semaphore,
}

impl SqlConnMgr {
    pub fn new(max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Semaphore::new(max_connections.max(1)),
        })
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("SqlConnMgr semaphore is never closed")
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
