use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use daq_features::features::FeatureFn;
use daq_features::prelude::*;
use daq_features::value::RegisterValue;
use daq_features::DriverClass;

fn connect(class: Arc<DriverClass>, mock: &Arc<MockBackend>) -> Driver {
    Driver::new(class, mock.clone(), DriverConfig::default()).unwrap()
}

fn suffix(letter: &'static str) -> FeatureFn {
    FeatureFn::transform(move |_, _, value| {
        Ok(Value::Str(format!("{}{letter}", value.as_str().unwrap_or_default())))
    })
}

#[test]
fn test_cache_coherence() {
    let class = ClassBody::new("Source")
        .feature("range", features::int().getter("RANGE?").setter("RANGE {}"))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("RANGE?", "3"));
    let driver = connect(class, &mock);

    driver.get("range").unwrap();
    driver.get("range").unwrap();
    assert_eq!(mock.get_count(), 1);

    driver.set("range", 5).unwrap();
    assert_eq!(driver.get("range").unwrap(), Value::Int(5));
    assert_eq!(mock.get_count(), 1);

    driver.clear_cache(true, true, None);
    driver.get("range").unwrap();
    assert_eq!(mock.get_count(), 2);
}

#[test]
fn test_caching_can_be_disabled() {
    let class = ClassBody::new("Source")
        .feature("range", features::int().getter("RANGE?"))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("RANGE?", "3"));
    let config = DriverConfig {
        caching_allowed: false,
        ..DriverConfig::default()
    };
    let driver = Driver::new(class, mock.clone(), config).unwrap();
    driver.get("range").unwrap();
    driver.get("range").unwrap();
    assert_eq!(mock.get_count(), 2);
}

#[test]
fn test_redundant_set_is_skipped() {
    let class = ClassBody::new("Source")
        .feature("volt", features::float().getter("VOLT?").setter("VOLT {}"))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new());
    let driver = connect(class, &mock);

    driver.set("volt", 10.0).unwrap();
    driver.set("volt", 10.0).unwrap();
    driver.set("volt", 10).unwrap();
    assert_eq!(mock.set_count(), 1);

    driver.set("volt", 2.5).unwrap();
    assert_eq!(mock.set_count(), 2);
}

#[test]
fn test_feature_retry_bound() {
    let class = ClassBody::new("Source")
        .feature("volt", features::float().getter("VOLT?").retries(2))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("VOLT?", "1.0"));
    mock.fail_always(CommErrorKind::Timeout);
    let driver = connect(class, &mock);

    let err = driver.get("volt").unwrap_err();
    assert_eq!(err.comm_kind(), Some(CommErrorKind::Timeout));
    assert_eq!(mock.get_count(), 3);
    assert_eq!(mock.reopen_count(), 2);
}

#[test]
fn test_transient_failure_is_retried() {
    let class = ClassBody::new("Source")
        .feature("volt", features::float().getter("VOLT?").retries(1))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("VOLT?", "1.0"));
    mock.fail_next(1, CommErrorKind::Io);
    let driver = connect(class, &mock);

    assert_eq!(driver.get("volt").unwrap(), Value::Float(1.0));
    assert_eq!(mock.get_count(), 2);
    assert_eq!(mock.reopen_count(), 1);
}

#[test]
fn test_action_retry_bound() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let class = ClassBody::new("Source")
        .action(
            "arm",
            actions::action(Vec::<&str>::new(), move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DaqError::comm(CommErrorKind::Timeout, "no reply"))
            })
            .retries(3),
        )
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new());
    let driver = connect(class, &mock);

    let err = driver.call("arm", Args::new()).unwrap_err();
    assert!(matches!(err, DaqError::FailedCall { .. }));
    assert_eq!(err.root_cause().comm_kind(), Some(CommErrorKind::Timeout));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(mock.reopen_count(), 3);
}

#[test]
fn test_validation_precedes_io() {
    let class = ClassBody::new("Source")
        .feature(
            "range",
            features::int().setter("RANGE {}").limits((0.0, 10.0)),
        )
        .feature(
            "mode",
            features::string().setter("MODE {}").values(["AC", "DC"]),
        )
        .feature(
            "level",
            features::float()
                .setter("LVL {}")
                .checks("value < 5"),
        )
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new());
    let driver = connect(class, &mock);

    let err = driver.set("range", 20).unwrap_err();
    assert!(matches!(err, DaqError::OutOfLimits(_)));
    let err = driver.set("mode", "XX").unwrap_err();
    assert!(matches!(err, DaqError::InvalidValue { .. }));
    let err = driver.set("level", 7.0).unwrap_err();
    assert!(matches!(err, DaqError::CheckFailed { .. }));
    assert_eq!(mock.set_count(), 0);

    driver.set("level", 1.0).unwrap();
    assert_eq!(mock.set_count(), 1);
}

#[test]
fn test_action_checks_precede_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let class = ClassBody::new("Source")
        .action(
            "ramp",
            actions::action(["rate"], move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::None)
            })
            .checks("rate > 0"),
        )
        .build()
        .unwrap();
    let driver = connect(class, &Arc::new(MockBackend::new()));

    let err = driver.call("ramp", Args::new().arg(-1.0)).unwrap_err();
    assert!(matches!(err.root_cause(), DaqError::CheckFailed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    driver.call("ramp", Args::new().arg(1.0)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_derived_customization_leaves_base_untouched() {
    let base = ClassBody::new("Base")
        .feature("name", features::feature().getter("NAME?"))
        .build()
        .unwrap();
    let derived = ClassBody::new("Derived")
        .base(&base)
        .customize("name", "post_get", Specifier::Append, "tag", suffix("!"))
        .build()
        .unwrap();

    let mock = Arc::new(MockBackend::new().with_response("NAME?", "meter"));
    assert_eq!(connect(derived, &mock).get("name").unwrap(), Value::Str("meter!".into()));
    assert_eq!(connect(base, &mock).get("name").unwrap(), Value::Str("meter".into()));
}

#[test]
fn test_customization_order() {
    let class = ClassBody::new("Tagged")
        .feature("name", features::feature().getter("NAME?"))
        .customize("name", "post_get", Specifier::Append, "a", suffix("a"))
        .customize("name", "post_get", Specifier::Prepend, "b", suffix("b"))
        .customize("name", "post_get", Specifier::AddAfter("a".into()), "c", suffix("c"))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("NAME?", "x"));
    assert_eq!(connect(class, &mock).get("name").unwrap(), Value::Str("xbac".into()));
}

#[test]
fn test_replace_and_remove_fragments() {
    let base = ClassBody::new("Base")
        .feature("name", features::feature().getter("NAME?"))
        .customize("name", "post_get", Specifier::Append, "a", suffix("a"))
        .customize("name", "post_get", Specifier::Append, "b", suffix("b"))
        .build()
        .unwrap();
    let derived = ClassBody::new("Derived")
        .base(&base)
        .customize("name", "post_get", Specifier::Replace("a".into()), "a", suffix("z"))
        .remove_fragment("name", "post_get", "b")
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("NAME?", "x"));
    assert_eq!(connect(derived, &mock).get("name").unwrap(), Value::Str("xz".into()));
    assert_eq!(connect(base, &mock).get("name").unwrap(), Value::Str("xab".into()));
}

#[test]
fn test_post_set_check_failure() {
    let class = ClassBody::new("Source")
        .feature("volt", features::float().getter("VOLT?").setter("VOLT {}"))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new());
    mock.fail_check("-222, Data out of range");
    let driver = connect(class, &mock);

    let err = driver.set("volt", 1.0).unwrap_err();
    assert!(matches!(err, DaqError::OperationFailed { ref feature, .. } if feature == "volt"));
    assert_eq!(mock.check_count(), 1);
    assert!(driver.check_cache(true, true, None).get("volt").is_none());
}

#[test]
fn test_concurrent_reads_query_once() {
    let class = ClassBody::new("Source")
        .feature("range", features::int().custom_getter())
        .customize(
            "range",
            "get",
            Specifier::Override,
            "",
            FeatureFn::query(|feat, driver| {
                thread::sleep(Duration::from_millis(20));
                driver.default_get_feature(feat, "RANGE?", &[])
            }),
        )
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("RANGE?", "3"));
    let driver = connect(class, &mock);
    let barrier = Barrier::new(8);

    let values: Vec<Value> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    driver.get("range").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(values.iter().all(|v| *v == Value::Int(3)));
    assert_eq!(mock.get_count(), 1);
}

#[test]
fn test_concurrent_writes_keep_cache_consistent() {
    let class = ClassBody::new("Source")
        .feature("volt", features::float().getter("VOLT?").setter("VOLT {}"))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new());
    let driver = connect(class, &mock);

    thread::scope(|scope| {
        for i in 0..8 {
            let driver = &driver;
            scope.spawn(move || driver.set("volt", f64::from(i)).unwrap());
        }
    });
    assert_eq!(mock.set_count(), 8);
    let last = mock.commands().last().cloned().unwrap();
    let cached = driver.get("volt").unwrap();
    assert_eq!(format!("VOLT {}", cached.to_command_text()), last);
    assert_eq!(mock.get_count(), 0);
}

#[test]
fn test_failed_locked_action_releases_lock() {
    let class = ClassBody::new("Source")
        .feature("volt", features::float().getter("VOLT?"))
        .action(
            "arm",
            actions::action(Vec::<&str>::new(), |_, _| {
                Err(DaqError::comm(CommErrorKind::Timeout, "no reply"))
            })
            .lock()
            .retries(1),
        )
        .action(
            "fire",
            actions::action(Vec::<&str>::new(), |_, _| Ok(Value::Bool(true))).lock(),
        )
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("VOLT?", "1.0"));
    let driver = Arc::new(connect(class, &mock));

    assert!(driver.call("arm", Args::new()).is_err());
    assert_eq!(mock.reopen_count(), 1);

    let (tx, rx) = mpsc::channel();
    let other = driver.clone();
    thread::spawn(move || {
        let fired = other.call("fire", Args::new());
        let volt = other.get("volt");
        let _ = tx.send((fired, volt));
    });
    let (fired, volt) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("driver lock still held after a failed call");
    assert_eq!(fired.unwrap(), Value::Bool(true));
    assert_eq!(volt.unwrap(), Value::Float(1.0));
}

#[test]
fn test_register_above_i64_is_rejected() {
    let class = ClassBody::new("Source")
        .feature("flags", features::register([Some("ready")], 64).setter("FLAGS {}"))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new());
    let driver = connect(class, &mock);

    let names = RegisterValue::flag_names(&[Some("ready".to_string())], 64);
    let high = RegisterValue::new("FlagsFlags", 1 << 63, names.clone());
    let err = driver.set("flags", high).unwrap_err();
    assert!(matches!(err, DaqError::Conversion(_)), "{err}");
    assert_eq!(mock.set_count(), 0);

    driver.set("flags", RegisterValue::new("FlagsFlags", 0b1, names)).unwrap();
    assert_eq!(mock.commands().last().unwrap(), "FLAGS 1");
}
