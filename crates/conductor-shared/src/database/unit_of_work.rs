//! # Unit of Work
//!
//! Scoped database transaction wrapper. Every public mutation of the process
//! layer runs inside one: commit happens only through [`UnitOfWork::commit`],
//! and any other exit path (error return, panic, cancellation) rolls the
//! transaction back when the wrapper drops.
//!
//! Nesting is structural: callees take `&mut PgConnection` from the owning
//! unit, so there is exactly one commit point per chain. Outbox rows written
//! through a unit become visible to sweepers only after commit. Retry
//! backoff sleeps happen outside any unit.

use sqlx::postgres::PgConnection;
use sqlx::{PgPool, Postgres, Transaction};

use crate::errors::ConductorResult;

/// A scoped database transaction
#[derive(Debug)]
pub struct UnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl UnitOfWork {
    /// Open a new unit of work on the pool
    pub async fn begin(pool: &PgPool) -> ConductorResult<Self> {
        let tx = pool.begin().await?;
        Ok(Self { tx })
    }

    /// The connection to hand to store operations joining this unit
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Commit the unit
    pub async fn commit(self) -> ConductorResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Roll the unit back explicitly.
    ///
    /// Dropping an uncommitted unit has the same effect; this exists for
    /// call sites that want the rollback error surfaced.
    pub async fn rollback(self) -> ConductorResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
