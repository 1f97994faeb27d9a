//! The two-request script: fetch `a.json` and `b.json`, add the payloads,
//! show the sum.

use std::rc::Rc;

use serde_json::Number;

use crate::bootstrap::Bootstrap;
use crate::decorate::decorate;
use crate::error::{Error, Result};
use crate::log::LogSink;
use crate::promise::{Flow, Promise};
use crate::request::{Payload, Request, RequestOptions, Transport};

type Call0<T> = Rc<dyn Fn() -> Promise<T>>;
type Call1<A, T> = Rc<dyn Fn(Flow<A>) -> Promise<T>>;
type Call2<A, B, T> = Rc<dyn Fn(Flow<A>, Flow<B>) -> Promise<T>>;

/// The decorated call graph, wired to a transport and a sink.
#[derive(Clone)]
pub struct Script {
    get_a: Call0<Payload>,
    get_b: Call0<Payload>,
    my_add: Call2<Payload, Payload, Payload>,
    my_fn: Call0<Payload>,
    show: Call1<Payload, ()>,
}

impl Script {
    pub fn new(transport: Rc<dyn Transport>, sink: Rc<dyn LogSink>) -> Self {
        let fetch = |url: &'static str| {
            let transport = transport.clone();
            move || Request::new(RequestOptions::get(url), transport.clone()).send()
        };
        let get_a = decorate(fetch("a.json")).named("get_a");
        let get_b = decorate(fetch("b.json")).named("get_b");
        let my_add = decorate(add_payloads).named("my_add");
        let my_fn = {
            let (get_a, get_b, my_add) = (get_a.clone(), get_b.clone(), my_add.clone());
            decorate(move || {
                let p1 = get_a.call();
                let p2 = get_b.call();
                my_add.call(p1, p2)
            })
            .named("my_fn")
        };
        let show = decorate(move |value: Payload| sink.log(&format!("show: {}", display(&value))))
            .named("show");

        Script {
            get_a: Rc::new(move || get_a.call()),
            get_b: Rc::new(move || get_b.call()),
            my_add: Rc::new(move |a: Flow<Payload>, b: Flow<Payload>| my_add.call(a, b)),
            my_fn: Rc::new(move || my_fn.call()),
            show: Rc::new(move |value: Flow<Payload>| show.call(value)),
        }
    }

    pub fn get_a(&self) -> Promise<Payload> {
        (self.get_a)()
    }

    pub fn get_b(&self) -> Promise<Payload> {
        (self.get_b)()
    }

    pub fn my_add(&self, a: impl Into<Flow<Payload>>, b: impl Into<Flow<Payload>>) -> Promise<Payload> {
        (self.my_add)(a.into(), b.into())
    }

    pub fn my_fn(&self) -> Promise<Payload> {
        (self.my_fn)()
    }

    /// Logs `show: <value>` once `value` is available. A rejected value
    /// skips the log and rejects the returned promise with the same error.
    pub fn show(&self, value: impl Into<Flow<Payload>>) -> Promise<()> {
        (self.show)(value.into())
    }

    /// `show(my_fn())`, dropping the result: a rejection is only reported
    /// as unhandled.
    pub fn init(&self) {
        let _ = self.show(self.my_fn());
    }

    /// Entry point that runs [`Script::init`] once.
    pub fn bootstrap(&self) -> Bootstrap {
        let script = self.clone();
        Bootstrap::new(move || script.init())
    }
}

/// `a + b` on JSON payloads: numbers add, and a string on either side
/// concatenates.
pub fn add_payloads(a: Payload, b: Payload) -> Result<Payload> {
    match (&a, &b) {
        (Payload::Number(x), Payload::Number(y)) => add_numbers(x, y),
        (Payload::String(_), _) | (_, Payload::String(_)) => {
            Ok(Payload::String(format!("{}{}", display(&a), display(&b))))
        }
        _ => Err(Error::thrown(format!("cannot add {a} and {b}"))),
    }
}

fn add_numbers(x: &Number, y: &Number) -> Result<Payload> {
    if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Payload::from(sum));
        }
    }
    let sum = x.as_f64().unwrap_or(f64::NAN) + y.as_f64().unwrap_or(f64::NAN);
    Number::from_f64(sum)
        .map(Payload::Number)
        .ok_or_else(|| Error::thrown(format!("{x} + {y} is not a finite number")))
}

fn display(value: &Payload) -> String {
    match value {
        Payload::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics;
    use crate::log::MemorySink;
    use crate::request::{FixtureTransport, Method};
    use crate::runtime::Runtime;
    use serde_json::json;
    use std::cell::RefCell;
    use std::time::Duration;

    fn script(transport: FixtureTransport) -> (Script, MemorySink) {
        let sink = MemorySink::new();
        (Script::new(Rc::new(transport), Rc::new(sink.clone())), sink)
    }

    fn virtual_runtime() -> Runtime {
        Runtime::builder().virtual_clock(true).build().unwrap()
    }

    #[test]
    fn test_add_payloads() {
        assert_eq!(add_payloads(json!(2), json!(3)), Ok(json!(5)));
        assert_eq!(add_payloads(json!(0.5), json!(2)), Ok(json!(2.5)));
        assert_eq!(add_payloads(json!("a"), json!(1)), Ok(json!("a1")));
        assert!(matches!(add_payloads(json!(null), json!(1)), Err(Error::Thrown(_))));
    }

    #[test]
    fn test_show_five() {
        let (script, sink) = script(
            FixtureTransport::new()
                .respond("a.json", 2)
                .respond("b.json", 3)
                .latency_for("a.json", Duration::from_millis(30))
                .latency_for("b.json", Duration::from_millis(10)),
        );
        let mut rt = virtual_runtime();
        let bootstrap = script.bootstrap();
        assert!(rt.run_entry(&bootstrap).unwrap());
        assert_eq!(sink.lines(), vec!["show: 5"]);
        assert!(!rt.run_entry(&bootstrap).unwrap());
        assert_eq!(sink.lines().len(), 1);
    }

    #[test]
    fn test_my_fn_flattens_to_the_sum() {
        let (script, _) = script(FixtureTransport::new().respond("a.json", 2).respond("b.json", 3));
        let mut rt = virtual_runtime();
        let sum = rt.enter(|| script.my_fn()).unwrap();
        assert_eq!(rt.block_on(&sum), Ok(json!(5)));
    }

    #[test]
    fn test_network_error_skips_add_and_show() {
        let (script, sink) = script(
            FixtureTransport::new()
                .respond("a.json", 2)
                .fail("b.json", "NetworkError")
                .latency(Duration::from_millis(5)),
        );
        let network_error = Error::transport(Method::Get, "b.json", "NetworkError");

        let mut rt = virtual_runtime();
        let sum = rt
            .enter(|| script.my_add(script.get_a(), script.get_b()))
            .unwrap();
        assert_eq!(rt.block_on(&sum), Err(network_error.clone()));

        let shown = rt.enter(|| script.show(&sum)).unwrap();
        assert_eq!(rt.block_on(&shown), Err(network_error));
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_init_rejection_is_reported_unhandled() {
        let (script, sink) = script(FixtureTransport::new().respond("a.json", 2).fail("b.json", "NetworkError"));
        let reported = Rc::new(RefCell::new(Vec::new()));
        let seen = reported.clone();
        let _guard = diagnostics::on_unhandled_rejection(move |error| seen.borrow_mut().push(error.clone()));

        let mut rt = virtual_runtime();
        rt.run_entry(&script.bootstrap()).unwrap();
        assert!(sink.lines().is_empty());
        assert!(
            reported
                .borrow()
                .contains(&Error::transport(Method::Get, "b.json", "NetworkError"))
        );
    }
}
