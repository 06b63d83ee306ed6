//! Compensating-action sequences for multi-step writes.
//!
//! Each completed step records its inverse. If a later step fails, the
//! recorded inverses run newest-first before the original error is returned.
//! Inverses are plain data ([`Undo`]), not closures.

use tracing::{error, info};

use crate::db::Pool;
use crate::error::{Result, TraceError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    DeleteJob { job_id: i64 },
    DeleteJobItems { job_id: i64 },
}

impl Undo {
    async fn apply(&self, pool: &Pool) -> Result<()> {
        match self {
            Undo::DeleteJob { job_id } => {
                // Log rows reference the job.
                sqlx::query("DELETE FROM qr_reverse_job_logs WHERE job_id = ?")
                    .bind(job_id)
                    .execute(pool)
                    .await?;
                sqlx::query("DELETE FROM qr_reverse_jobs WHERE id = ?")
                    .bind(job_id)
                    .execute(pool)
                    .await?;
            }
            Undo::DeleteJobItems { job_id } => {
                sqlx::query("DELETE FROM qr_reverse_job_items WHERE job_id = ?")
                    .bind(job_id)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Compensation {
    name: &'static str,
    done: Vec<Undo>,
}

impl Compensation {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            done: Vec::new(),
        }
    }

    /// Record the inverse of a step that just succeeded.
    pub fn record(&mut self, undo: Undo) {
        self.done.push(undo);
    }

    pub fn recorded(&self) -> &[Undo] {
        &self.done
    }

    /// The sequence finished; nothing to undo.
    pub fn complete(self) {
        info!(sequence = self.name, steps = self.done.len(), "sequence completed");
    }

    /// Undo every recorded step newest-first, then return `cause`.
    ///
    /// A failing inverse is logged and the remaining inverses still run; the
    /// caller always gets the original error.
    pub async fn abort<T>(self, pool: &Pool, cause: TraceError) -> Result<T> {
        error!(sequence = self.name, error = %cause, steps = self.done.len(), "sequence failed; compensating");
        for undo in self.done.iter().rev() {
            if let Err(err) = undo.apply(pool).await {
                error!(sequence = self.name, ?undo, error = %err, "compensating action failed");
            }
        }
        Err(cause)
    }
}
