use crate::error::{KeyOp, MigrationError};
use crate::logger::Logger;
use crate::store::{Datastore, Key};

/// Moves every entry under `from_prefix` in `from` into `to`, rewriting the
/// prefix to `to_prefix`. Each key is copied before it is deleted, and puts
/// overwrite, so rerunning after an interruption finishes the job.
///
/// Returns the number of entries moved.
pub fn transfer(
    from: &dyn Datastore,
    to: &dyn Datastore,
    from_prefix: &str,
    to_prefix: &str,
    log: &Logger,
) -> Result<usize, MigrationError> {
    let keys = from
        .query(from_prefix)
        .map_err(|e| MigrationError::transform(&Key::new(from_prefix), KeyOp::Query, e))?;
    log.log(&format!(
        "transferring {} entries from {from_prefix:?} to {to_prefix:?}",
        keys.len()
    ));

    let mut moved = 0;
    for key in keys {
        let rest = key.as_str().strip_prefix(from_prefix).unwrap_or(key.as_str());
        let target = Key::new(format!("{to_prefix}{rest}"));

        let value = from
            .get(&key)
            .map_err(|e| MigrationError::transform(&key, KeyOp::Get, e))?;
        to.put(&target, &value)
            .map_err(|e| MigrationError::transform(&target, KeyOp::Put, e))?;
        from.delete(&key)
            .map_err(|e| MigrationError::transform(&key, KeyOp::Delete, e))?;

        moved += 1;
        if moved % 1000 == 0 {
            log.vlog(&format!("moved {moved} entries"));
        }
    }

    to.sync()
        .map_err(|e| MigrationError::transform(&Key::new(to_prefix), KeyOp::Put, e))?;
    log.log(&format!("transfer complete: {moved} entries moved"));
    Ok(moved)
}
