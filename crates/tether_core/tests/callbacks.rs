use std::rc::Rc;
use tether_core::{EnvConfig, Environment, Fault, Scope, ScopeKind, TraceConvention, UsageFault, Value};
use tether_script::HeapEngine;

#[test]
fn test_host_to_engine_to_host_fault_merges_layers() {
    let (_env, _root) = Environment::attach(Rc::new(HeapEngine::new()), EnvConfig::default()).unwrap();

    let inner = Value::function("innerHost", |_| {
        Err(UsageFault::NoCurrentScope { operation: "innerHost" }.into())
    })
    .unwrap();
    let global = Value::global().unwrap();
    global.set("inner", &inner).unwrap();

    let outer = Value::function("outerHost", |_| {
        let inner = Value::global()?.get("inner")?;
        inner.call(&Value::default(), &[])
    })
    .unwrap();

    let fault = outer.call(&Value::default(), &[]).unwrap_err();
    let engine_fault = fault.as_engine().expect("engine fault");
    assert_eq!(engine_fault.operation, "Value::call");

    let trace = fault.merged_trace(TraceConvention::Engine);
    assert!(trace.contains("caused by: innerHost: no scope is open on this thread"));
    assert!(trace.contains("--- host/engine boundary ---"));
    let innermost = trace.find("at innerHost (native)").expect("inner frame");
    let boundary = trace.find("host/engine boundary").unwrap();
    assert!(innermost < boundary);
}

#[test]
fn test_callback_can_reenter_and_build_values() {
    let (_env, root) = Environment::attach(Rc::new(HeapEngine::new()), EnvConfig::default()).unwrap();
    let make_point = Value::function("makePoint", |args| {
        let point = Value::object()?;
        point.set("x", &args.get(0))?;
        point.set("y", &args.get(1))?;
        Ok(point)
    })
    .unwrap();

    let point = make_point
        .call(&Value::default(), &[Value::number(1.0).unwrap(), Value::number(2.0).unwrap()])
        .unwrap();
    assert_eq!(point.scope(), Some(root.scope()));
    assert_eq!(point.get("y").unwrap().as_f64().unwrap(), 2.0);
    assert_eq!(Scope::current().as_ref(), Some(root.scope()));
}

#[test]
fn test_callback_cannot_leak_its_scope() {
    let (_env, _root) = Environment::attach(Rc::new(HeapEngine::new()), EnvConfig::default()).unwrap();
    let leak = Rc::new(std::cell::RefCell::new(None));
    let slot = leak.clone();
    let capture = Value::function("capture", move |args| {
        *slot.borrow_mut() = Some(args.get(0));
        Ok(Value::default())
    })
    .unwrap();
    capture
        .call(&Value::default(), &[Value::string("arg").unwrap()])
        .unwrap();

    let leaked: Value = leak.borrow_mut().take().unwrap();
    let fault: Fault = leaked.as_string().unwrap_err();
    assert!(fault.is_scope_closed());
}

#[test]
fn test_failure_while_unwinding_callback_fault_is_fatal() {
    // The hook turns the abort into a panic this thread can report
    tether_core::fault::set_fatal_hook(|report| panic!("fatal: {}", report.reason));

    let outcome = std::thread::spawn(|| {
        let (_env, root) = Environment::attach(Rc::new(HeapEngine::new()), EnvConfig::default()).unwrap();
        let broken = Value::function("broken", |args| {
            let env = args.scope().environment().cloned().expect("callback environment");
            // Left open so the Callback scope can no longer close
            std::mem::forget(Scope::open(ScopeKind::Handle, &env)?);
            Err(UsageFault::NoCurrentScope { operation: "broken" }.into())
        })
        .unwrap();
        std::mem::forget(root);
        let _ = broken.call(&Value::default(), &[]);
    })
    .join();

    let payload = outcome.expect_err("nested fault must not return");
    let message = payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default();
    assert!(message.contains("fatal: callback scope failed to close while unwinding"));
}
