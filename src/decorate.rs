//! Turning plain functions into promise-returning ones.
//!
//! ```
//! use dyad_flow::{decorate, microtask, Promise};
//!
//! let add = decorate(|a: i32, b: i32| a + b).named("add");
//! let a = Promise::pending();
//! let sum = add.call(&a, 2);
//! a.resolve(3);
//! microtask::drain();
//! assert_eq!(sum.value(), Some(5));
//! ```

use std::marker::PhantomData;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::Error;
use crate::join::Join;
use crate::outcome::{IntoOutcome, from_flow};
use crate::promise::{Flow, Promise, guarded};

/// A function that can sit behind a [`Decorated`] wrapper.
///
/// Implemented for every `Fn` of up to six arguments whose return type
/// implements [`IntoOutcome`].
pub trait Body<Args> {
    type Output: Clone + 'static;

    fn invoke(&self, args: Args) -> Result<Flow<Self::Output>, Error>;
}

macro_rules! impl_body {
    ($($A:ident $a:ident),*) => {
        impl<F, O, $($A),*> Body<($($A,)*)> for F
        where
            F: Fn($($A),*) -> O,
            O: IntoOutcome,
        {
            type Output = O::Output;

            fn invoke(&self, ($($a,)*): ($($A,)*)) -> Result<Flow<O::Output>, Error> {
                (self)($($a),*).into_flow()
            }
        }
    };
}

impl_body!();
impl_body!(A a);
impl_body!(A a, B b);
impl_body!(A a, B b, C c);
impl_body!(A a, B b, C c, D d);
impl_body!(A a, B b, C c, D d, E e);
impl_body!(A a, B b, C c, D d, E e, G g);

/// Wrap `body` so that every call returns a promise.
///
/// `body` itself is left untouched; the wrapper only holds a shared
/// reference to it.
pub fn decorate<F, Args>(body: F) -> Decorated<F, Args>
where
    F: Body<Args> + 'static,
{
    Decorated {
        name: Rc::from(std::any::type_name::<F>()),
        body: Rc::new(body),
        phantom: PhantomData,
    }
}

/// The wrapper produced by [`decorate`].
///
/// Calling it with values runs the body right away. Calling it with promises
/// waits for all of them, then runs the body with their values in argument
/// order. If one of them rejects, the body is skipped and the call rejects
/// with that error.
pub struct Decorated<F, Args> {
    name: Rc<str>,
    body: Rc<F>,
    phantom: PhantomData<fn(Args)>,
}

impl<F, Args> Clone for Decorated<F, Args> {
    fn clone(&self) -> Self {
        Decorated {
            name: self.name.clone(),
            body: self.body.clone(),
            phantom: PhantomData,
        }
    }
}

impl<F, Args> Decorated<F, Args>
where
    F: Body<Args> + 'static,
    Args: Clone + 'static,
{
    /// Name used in tracing output and panic reports.
    pub fn named(mut self, name: impl Into<Rc<str>>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn dispatch<J>(&self, args: J) -> Promise<F::Output>
    where
        J: Join<Output = Args>,
    {
        let flows = match args.try_ready() {
            Ok(values) => return from_flow(invoke(&self.name, &*self.body, values)),
            Err(flows) => flows,
        };
        trace!(function = %self.name, "waiting on dependencies");
        let name = self.name.clone();
        let body = self.body.clone();
        let out = Promise::pending();
        let target = out.clone();
        flows.join().subscribe(move |result| match result {
            Ok(values) => target.settle_with(invoke(&name, &*body, values)),
            Err(error) => {
                debug!(function = %name, %error, "dependency rejected, body skipped");
                target.reject(error);
            }
        });
        out
    }
}

fn invoke<F, Args>(name: &str, body: &F, args: Args) -> Result<Flow<F::Output>, Error>
where
    F: Body<Args>,
{
    trace!(function = name, "invoking body");
    guarded(name, move || body.invoke(args))
}

macro_rules! impl_call {
    ($($A:ident $a:ident),*) => {
        impl<F, $($A: Clone + 'static),*> Decorated<F, ($($A,)*)>
        where
            F: Body<($($A,)*)> + 'static,
        {
            pub fn call(&self, $($a: impl Into<Flow<$A>>),*) -> Promise<F::Output> {
                self.dispatch(($($a.into(),)*))
            }
        }
    };
}

impl_call!();
impl_call!(A a);
impl_call!(A a, B b);
impl_call!(A a, B b, C c);
impl_call!(A a, B b, C c, D d);
impl_call!(A a, B b, C c, D d, E e);
impl_call!(A a, B b, C c, D d, E e, G g);

impl<F, T> Decorated<F, (Vec<T>,)>
where
    F: Body<(Vec<T>,)> + 'static,
    T: Clone + 'static,
{
    /// Variadic form: any number of values or promises, passed to the body
    /// as one `Vec` in call order.
    pub fn call_all<I>(&self, args: I) -> Promise<F::Output>
    where
        I: IntoIterator,
        I::Item: Into<Flow<T>>,
    {
        let flows: Vec<Flow<T>> = args.into_iter().map(Into::into).collect();
        let flow = match flows.try_ready() {
            Ok(values) => Flow::Ready(values),
            Err(flows) => Flow::Pending(flows.join()),
        };
        self.dispatch((flow,))
    }
}
