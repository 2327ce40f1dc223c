//! Shared error plumbing.

use std::error::Error;

/// Error type returned by handler bodies and other user-supplied code.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Find the first error of type `E` in `error`'s source chain, `error`
/// itself included.
///
/// # Examples
///
/// ```
/// use eventstore_tools_core::error::find_cause;
/// use std::io;
///
/// let err: Box<dyn std::error::Error + Send + Sync> =
///     Box::new(io::Error::new(io::ErrorKind::Other, "boom"));
/// assert!(find_cause::<io::Error>(&*err).is_some());
/// assert!(find_cause::<std::fmt::Error>(&*err).is_none());
/// ```
#[must_use]
pub fn find_cause<'a, E: Error + 'static>(error: &'a (dyn Error + 'static)) -> Option<&'a E> {
    let mut current: Option<&(dyn Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(found) = err.downcast_ref::<E>() {
            return Some(found);
        }
        current = err.source();
    }
    None
}

/// Whether `error` or any of its sources is an `E`.
#[must_use]
pub fn has_cause<E: Error + 'static>(error: &(dyn Error + 'static)) -> bool {
    find_cause::<E>(error).is_some()
}
