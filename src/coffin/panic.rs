//! # Panic payload resolution.
//!
//! Converts the payload caught by `catch_unwind` into an error:
//!
//! | payload                                  | result                          |
//! |------------------------------------------|---------------------------------|
//! | `&'static str`, `String`                 | [`PanicError::Message`]         |
//! | [`BoxError`], [`SharedError`]            | passed through                  |
//! | [`ModuleError`], [`KernelError`]         | passed through                  |
//! | anything else (including `()`)           | [`PanicError::Unhandled`]       |

use std::any::Any;

use super::error::{PanicError, SharedError};
use crate::error::{BoxError, KernelError, ModuleError};

/// Converts a recovered panic payload into an error.
///
/// # Example
/// ```
/// use modvisor::coffin::resolve_panic;
///
/// let payload = std::panic::catch_unwind(|| {
///     panic!("boom");
/// })
/// .unwrap_err();
/// assert_eq!(resolve_panic(payload).to_string(), "panic: boom");
/// ```
pub fn resolve_panic(payload: Box<dyn Any + Send>) -> BoxError {
    let payload = match payload.downcast::<&'static str>() {
        Ok(message) => return message_error(message.to_string()),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<String>() {
        Ok(message) => return message_error(*message),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<BoxError>() {
        Ok(err) => return *err,
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<SharedError>() {
        Ok(err) => return Box::new(*err),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<ModuleError>() {
        Ok(err) => return err,
        Err(payload) => payload,
    };
    if let Ok(err) = payload.downcast::<KernelError>() {
        return err;
    }
    Box::new(PanicError::Unhandled)
}

fn message_error(message: String) -> BoxError {
    Box::new(PanicError::Message { message })
}
