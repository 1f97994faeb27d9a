//! Flattening of whatever a decorated body or continuation returns.

use std::rc::Rc;

use crate::error::Error;
use crate::promise::{Flow, Promise};

/// Conversion of a body's return value into the state of a promise.
///
/// A `Promise<T>` has `Output = T`, so a promise is never stored as another
/// promise's value. Downstream types opt in with [`impl_into_outcome!`].
pub trait IntoOutcome {
    type Output: Clone + 'static;

    fn into_flow(self) -> Result<Flow<Self::Output>, Error>;
}

impl<T: Clone + 'static> IntoOutcome for Promise<T> {
    type Output = T;

    fn into_flow(self) -> Result<Flow<T>, Error> {
        Ok(Flow::Pending(self))
    }
}

impl<T: Clone + 'static> IntoOutcome for Flow<T> {
    type Output = T;

    fn into_flow(self) -> Result<Flow<T>, Error> {
        Ok(self)
    }
}

impl<O, E> IntoOutcome for Result<O, E>
where
    O: IntoOutcome,
    E: Into<Error>,
{
    type Output = O::Output;

    fn into_flow(self) -> Result<Flow<O::Output>, Error> {
        match self {
            Ok(value) => value.into_flow(),
            Err(error) => Err(error.into()),
        }
    }
}

/// Implement [`IntoOutcome`] for types that settle as plain values.
#[macro_export]
macro_rules! impl_into_outcome {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::IntoOutcome for $ty {
                type Output = $ty;

                fn into_flow(self) -> ::std::result::Result<$crate::Flow<$ty>, $crate::Error> {
                    Ok($crate::Flow::Ready(self))
                }
            }
        )*
    };
}

impl_into_outcome!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    &'static str,
    serde_json::Value,
);

macro_rules! impl_into_outcome_generic {
    ($($ty:ident<$($param:ident),+>),* $(,)?) => {
        $(
            impl<$($param: Clone + 'static),+> IntoOutcome for $ty<$($param),+> {
                type Output = $ty<$($param),+>;

                fn into_flow(self) -> Result<Flow<Self::Output>, Error> {
                    Ok(Flow::Ready(self))
                }
            }
        )*
    };
}

impl_into_outcome_generic!(Vec<T>, Option<T>, Box<T>, Rc<T>);

macro_rules! impl_into_outcome_tuple {
    ($(($($param:ident),+)),* $(,)?) => {
        $(
            impl<$($param: Clone + 'static),+> IntoOutcome for ($($param,)+) {
                type Output = ($($param,)+);

                fn into_flow(self) -> Result<Flow<Self::Output>, Error> {
                    Ok(Flow::Ready(self))
                }
            }
        )*
    };
}

impl_into_outcome_tuple!((A, B), (A, B, C), (A, B, C, D));

/// Turn a raw return value into the promise representing it.
///
/// A returned promise is handed back as-is rather than wrapped again; plain
/// values and errors become pre-settled promises.
pub fn flatten<O: IntoOutcome>(outcome: O) -> Promise<O::Output> {
    from_flow(outcome.into_flow())
}

pub(crate) fn from_flow<T: Clone + 'static>(outcome: Result<Flow<T>, Error>) -> Promise<T> {
    match outcome {
        Ok(Flow::Ready(value)) => Promise::fulfilled(value),
        Ok(Flow::Pending(promise)) => promise,
        Err(error) => Promise::rejected(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Celsius(f64);

    impl_into_outcome!(Celsius);

    #[test]
    fn test_flatten_values() {
        assert_eq!(flatten(3u8).value(), Some(3));
        assert_eq!(flatten(vec![1, 2]).value(), Some(vec![1, 2]));
        assert_eq!(flatten(Celsius(21.5)).value(), Some(Celsius(21.5)));
        assert_eq!(flatten(Some("x")).value(), Some(Some("x")));
    }

    #[test]
    fn test_flatten_returns_same_promise() {
        let inner = Promise::<i32>::pending();
        let flat = flatten(inner.clone());
        assert!(flat.ptr_eq(&inner));

        let flat = flatten(Ok::<_, Error>(inner.clone()));
        assert!(flat.ptr_eq(&inner));
    }

    #[test]
    fn test_flatten_err() {
        let p = flatten(Err::<i32, _>(Error::thrown("no")));
        assert_eq!(p.error(), Some(Error::thrown("no")));
        let _ = p.catch(|_| 0);
    }
}
