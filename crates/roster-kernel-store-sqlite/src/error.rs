use roster_kernel_core::KernelError;
use rusqlite::ffi;
use rusqlite::ErrorCode;

/// Translate a driver error into the kernel taxonomy.
///
/// `context` names the operation and is folded into the detail string.
pub(crate) fn map_sqlite_error(err: rusqlite::Error, context: &str) -> KernelError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let detail = match message {
                Some(message) => format!("{context}: {message}"),
                None => format!("{context}: {err}"),
            };
            match failure.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::OperationInterrupted => KernelError::transient(detail),
                ErrorCode::ConstraintViolation => match failure.extended_code {
                    ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                        KernelError::integrity("foreign_key", detail)
                    }
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        KernelError::conflict("row", constraint_target(message.as_deref()), detail)
                    }
                    _ => KernelError::integrity("constraint", detail),
                },
                _ => KernelError::storage(detail),
            }
        }
        rusqlite::Error::QueryReturnedNoRows => KernelError::not_found("row", context),
        _ => KernelError::storage(format!("{context}: {err}")),
    }
}

/// `UNIQUE constraint failed: users.user_code` -> `users.user_code`.
fn constraint_target(message: Option<&str>) -> String {
    message
        .and_then(|text| text.rsplit_once(": "))
        .map_or_else(|| "unknown".to_string(), |(_, target)| target.to_string())
}

pub(crate) trait StoreResultExt<T> {
    fn map_store(self, context: &str) -> Result<T, KernelError>;
}

impl<T> StoreResultExt<T> for Result<T, rusqlite::Error> {
    fn map_store(self, context: &str) -> Result<T, KernelError> {
        self.map_err(|err| map_sqlite_error(err, context))
    }
}
