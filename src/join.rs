//! Waiting on several values at once.
//!
//! A join subscribes to every pending element up front, so the elements
//! settle independently of each other. The joined promise fulfils with the
//! values in positional order after the last one fulfils, or rejects with the
//! first rejection observed. Anything settling after that is ignored.

use std::cell::RefCell;
use std::rc::Rc;

use crate::promise::{Flow, Promise};

pub trait Join: Sized {
    type Output: Clone + 'static;

    /// True when no element is a promise.
    fn is_ready(&self) -> bool;

    /// The values, if none of them is pending.
    fn try_ready(self) -> Result<Self::Output, Self>;

    fn join(self) -> Promise<Self::Output>;
}

struct JoinState<S> {
    slots: S,
    remaining: usize,
    done: bool,
}

macro_rules! impl_join {
    ($(($A:ident $a:ident $idx:tt))+) => {
        impl<$($A: Clone + 'static),+> Join for ($(Flow<$A>,)+) {
            type Output = ($($A,)+);

            fn is_ready(&self) -> bool {
                true $(&& !self.$idx.is_promise())+
            }

            fn try_ready(self) -> Result<Self::Output, Self> {
                match self {
                    ($(Flow::Ready($a),)+) => Ok(($($a,)+)),
                    other => Err(other),
                }
            }

            fn join(self) -> Promise<Self::Output> {
                let joined = match self.try_ready() {
                    Ok(values) => return Promise::fulfilled(values),
                    Err(flows) => flows,
                };
                fn take_all<$($A),+>(slots: &mut ($(Option<$A>,)+)) -> Option<($($A,)+)> {
                    Some(($(slots.$idx.take()?,)+))
                }

                let out = Promise::pending();
                let state = Rc::new(RefCell::new(JoinState {
                    slots: ($(None::<$A>,)+),
                    remaining: 0,
                    done: false,
                }));
                let ($($a,)+) = joined;
                $(
                    match $a {
                        Flow::Ready(value) => state.borrow_mut().slots.$idx = Some(value),
                        Flow::Pending(promise) => {
                            state.borrow_mut().remaining += 1;
                            let state = state.clone();
                            let target = out.clone();
                            // reactions run on a later turn, after every element is counted
                            promise.subscribe(move |result| {
                                let mut st = state.borrow_mut();
                                if st.done {
                                    return;
                                }
                                match result {
                                    Ok(value) => {
                                        st.slots.$idx = Some(value);
                                        st.remaining -= 1;
                                        if st.remaining > 0 {
                                            return;
                                        }
                                        st.done = true;
                                        let values = take_all(&mut st.slots);
                                        drop(st);
                                        if let Some(values) = values {
                                            target.resolve(values);
                                        }
                                    }
                                    Err(error) => {
                                        st.done = true;
                                        drop(st);
                                        target.reject(error);
                                    }
                                }
                            });
                        }
                    }
                )+
                out
            }
        }
    };
}

impl Join for () {
    type Output = ();

    fn is_ready(&self) -> bool {
        true
    }

    fn try_ready(self) -> Result<(), Self> {
        Ok(())
    }

    fn join(self) -> Promise<()> {
        Promise::fulfilled(())
    }
}

impl_join!((A a 0));
impl_join!((A a 0) (B b 1));
impl_join!((A a 0) (B b 1) (C c 2));
impl_join!((A a 0) (B b 1) (C c 2) (D d 3));
impl_join!((A a 0) (B b 1) (C c 2) (D d 3) (E e 4));
impl_join!((A a 0) (B b 1) (C c 2) (D d 3) (E e 4) (G g 5));

impl<T: Clone + 'static> Join for Vec<Flow<T>> {
    type Output = Vec<T>;

    fn is_ready(&self) -> bool {
        self.iter().all(|flow| !flow.is_promise())
    }

    fn try_ready(self) -> Result<Vec<T>, Self> {
        if !self.is_ready() {
            return Err(self);
        }
        Ok(self
            .into_iter()
            .filter_map(|flow| match flow {
                Flow::Ready(value) => Some(value),
                Flow::Pending(_) => None,
            })
            .collect())
    }

    fn join(self) -> Promise<Vec<T>> {
        let flows = match self.try_ready() {
            Ok(values) => return Promise::fulfilled(values),
            Err(flows) => flows,
        };
        let out = Promise::pending();
        let state = Rc::new(RefCell::new(JoinState {
            slots: Vec::with_capacity(flows.len()),
            remaining: 0,
            done: false,
        }));
        for (index, flow) in flows.into_iter().enumerate() {
            match flow {
                Flow::Ready(value) => state.borrow_mut().slots.push(Some(value)),
                Flow::Pending(promise) => {
                    {
                        let mut st = state.borrow_mut();
                        st.slots.push(None);
                        st.remaining += 1;
                    }
                    let state = state.clone();
                    let target = out.clone();
                    promise.subscribe(move |result| {
                        let mut st = state.borrow_mut();
                        if st.done {
                            return;
                        }
                        match result {
                            Ok(value) => {
                                st.slots[index] = Some(value);
                                st.remaining -= 1;
                                if st.remaining > 0 {
                                    return;
                                }
                                st.done = true;
                                let values: Option<Vec<T>> =
                                    st.slots.iter_mut().map(Option::take).collect();
                                drop(st);
                                if let Some(values) = values {
                                    target.resolve(values);
                                }
                            }
                            Err(error) => {
                                st.done = true;
                                drop(st);
                                target.reject(error);
                            }
                        }
                    });
                }
            }
        }
        out
    }
}

/// Fulfils with every value in order, or rejects with the first rejection.
pub fn join_all<T: Clone + 'static>(promises: impl IntoIterator<Item = Promise<T>>) -> Promise<Vec<T>> {
    promises.into_iter().map(Flow::from).collect::<Vec<_>>().join()
}
