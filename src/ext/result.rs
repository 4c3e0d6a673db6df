//! Extensions to `Result`.

/// Wrap a value in `Ok`, for the tail position of fallible chains.
pub trait WrapOk<T> {
    /// Wrap `self` in `Ok`.
    fn wrap_ok<E>(self) -> Result<T, E>;
}

impl<T> WrapOk<T> for T {
    fn wrap_ok<E>(self) -> Result<T, E> {
        Ok(self)
    }
}

/// Wrap a value in `Err`, for the tail position of fallible chains.
pub trait WrapErr<E> {
    /// Wrap `self` in `Err`.
    fn wrap_err<T>(self) -> Result<T, E>;
}

impl<E> WrapErr<E> for E {
    fn wrap_err<T>(self) -> Result<T, E> {
        Err(self)
    }
}

/// Discard the `Ok` value of a `Result`, keeping only whether it succeeded.
pub trait DiscardResult<E> {
    /// Map the `Ok` variant to `()`.
    fn discard_ok(self) -> Result<(), E>;
}

impl<T, E> DiscardResult<E> for Result<T, E> {
    fn discard_ok(self) -> Result<(), E> {
        self.map(|_| ())
    }
}
