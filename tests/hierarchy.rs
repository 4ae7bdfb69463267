//! Subsystems, channels and the per-instance runtime state hanging off them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use daq_features::features::{FeatureFn, FeatureStage};
use daq_features::prelude::*;
use daq_features::DriverClass;
use tracing_test::traced_test;

fn connect(class: Arc<DriverClass>, mock: &Arc<MockBackend>) -> Driver {
    Driver::new(class, mock.clone(), DriverConfig::default()).unwrap()
}

fn installed(high_voltage: bool) -> Value {
    let options: BTreeMap<String, Value> = [("high_voltage".to_string(), Value::Bool(high_voltage))]
        .into_iter()
        .collect();
    Value::Map(options)
}

fn scope() -> Arc<DriverClass> {
    ClassBody::new("Scope")
        .version("2.1")
        .feature("volt", features::float().getter("VOLT?").setter("VOLT {}"))
        .feature("range", features::int().getter("RANGE?"))
        .subsystem("trigger", |ss| {
            ss.feature("level", features::float().getter("TRIG:LEV?").setter("TRIG:LEV {}"))
                .feature("source", features::alias(".volt", true))
                .feature(
                    "arm",
                    features::boolean().setter("TRIG:ARM {}").discard([".range"]),
                )
        })
        .channel("ch", |ch| {
            ch.available(Available::ids([1, 2]))
                .alias("A", 1)
                .alias("B", 2)
                .feature("scale", features::float().getter("CH{id}:SCAL?").setter("CH{id}:SCAL {}"))
        })
        .build()
        .unwrap()
}

#[test]
fn test_subsystem_and_channel_commands() {
    let mock = Arc::new(
        MockBackend::new()
            .with_response("CH1:SCAL?", "0.5")
            .with_response("CH2:SCAL?", "2"),
    );
    let driver = connect(scope(), &mock);

    driver.subsystem("trigger").unwrap().set("level", 0.25).unwrap();
    assert_eq!(mock.commands(), vec!["TRIG:LEV 0.25".to_string()]);

    let scales: Vec<Value> = driver
        .channels("ch")
        .unwrap()
        .iter()
        .unwrap()
        .into_iter()
        .map(|ch| ch.get("scale").unwrap())
        .collect();
    assert_eq!(scales, vec![Value::Float(0.5), Value::Float(2.0)]);

    driver.channel("ch", "B").unwrap().set("scale", 1.0).unwrap();
    assert_eq!(mock.commands().last().map(String::as_str), Some("CH2:SCAL 1"));

    let snapshot = driver.check_cache(true, true, None);
    assert_eq!(snapshot.subsystems["trigger"].get("level"), Some(&Value::Float(0.25)));
    assert_eq!(snapshot.channels["ch"][&ChannelId::Int(2)].get("scale"), Some(&Value::Float(1.0)));
}

#[test]
fn test_unknown_members() {
    let driver = connect(scope(), &Arc::new(MockBackend::new()));
    assert!(matches!(driver.get("missing"), Err(DaqError::UnknownMember { .. })));
    assert!(driver.subsystem("ch").is_err());
    assert!(driver.channel("ch", 3).is_err());
    assert!(matches!(
        driver.set("range", 2),
        Err(DaqError::NotSettable(ref name)) if name == "range"
    ));
}

#[test]
fn test_alias_forwards_to_parent() {
    let mock = Arc::new(MockBackend::new());
    let driver = connect(scope(), &mock);
    let trigger = driver.subsystem("trigger").unwrap();

    trigger.set("source", 2.0).unwrap();
    assert_eq!(mock.commands(), vec!["VOLT 2".to_string()]);
    assert_eq!(trigger.get("source").unwrap(), Value::Float(2.0));
    assert_eq!(mock.get_count(), 0);
    assert!(trigger.check_cache(false, false, None).get("source").is_none());
}

#[test]
fn test_set_discards_parent_cache() {
    let mock = Arc::new(MockBackend::new().with_response("RANGE?", "4"));
    let driver = connect(scope(), &mock);

    driver.get("range").unwrap();
    driver.get("range").unwrap();
    assert_eq!(mock.get_count(), 1);

    driver.subsystem("trigger").unwrap().set("arm", true).unwrap();
    driver.get("range").unwrap();
    assert_eq!(mock.get_count(), 2);
}

#[test]
fn test_channel_listing_from_action() {
    let class = ClassBody::new("Switch")
        .action(
            "list_ports",
            actions::action(Vec::<&str>::new(), |_, _| Ok(Value::from(vec![1, 3]))),
        )
        .channel("port", |ch| {
            ch.available(Available::action("list_ports"))
                .feature("state", features::boolean().getter("PORT{id}?"))
        })
        .build()
        .unwrap();
    let driver = connect(class, &Arc::new(MockBackend::new()));
    let ports = driver.channels("port").unwrap();
    assert_eq!(ports.available().unwrap(), vec![ChannelId::Int(1), ChannelId::Int(3)]);
    assert!(ports.get(2).is_err());
    assert_eq!(ports.get(3).unwrap().owner_name(), "Switch.port[3]");
}

#[test]
fn test_named_limits_follow_instrument_state() {
    let class = ClassBody::new("Supply")
        .feature(
            "max_volt",
            features::float()
                .getter("VMAX?")
                .setter("VMAX {}")
                .discard_limits(["volt"]),
        )
        .feature("volt", features::float().setter("VOLT {}").limits("volt"))
        .limit("_limits_volt", |driver| {
            let maximum = driver.get("max_volt")?.as_f64().unwrap_or_default();
            LimitsValidator::float(Some(0.0), Some(maximum), None)
        })
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("VMAX?", "5"));
    let driver = connect(class, &mock);

    let err = driver.set("volt", 6.0).unwrap_err();
    assert!(matches!(err, DaqError::OutOfLimits(_)));
    assert_eq!(mock.set_count(), 0);

    driver.set("max_volt", 10.0).unwrap();
    driver.set("volt", 6.0).unwrap();
    assert_eq!(mock.commands().last().map(String::as_str), Some("VOLT 6"));
    assert_eq!(mock.get_count(), 1);
}

#[test]
fn test_options_gate_subsystems_and_actions() {
    let class = ClassBody::new("Source")
        .feature("opts", features::options(["high_voltage"]).getter("*OPT?"))
        .subsystem("hv", |ss| {
            ss.options("opts.high_voltage == true")
                .feature("level", features::float().getter("HV?"))
        })
        .action(
            "hv_ramp",
            actions::action(Vec::<&str>::new(), |_, _| Ok(Value::None))
                .options("opts.high_voltage == true"),
        )
        .build()
        .unwrap();

    let mock = Arc::new(MockBackend::new().with_response("*OPT?", installed(false)));
    let driver = connect(class.clone(), &mock);
    assert!(matches!(driver.subsystem("hv"), Err(DaqError::AccessDenied { .. })));
    assert!(matches!(
        driver.call("hv_ramp", Args::new()),
        Err(DaqError::AccessDenied { .. })
    ));
    assert_eq!(mock.get_count(), 1);

    let mock = Arc::new(
        MockBackend::new()
            .with_response("*OPT?", installed(true))
            .with_response("HV?", "1000"),
    );
    let driver = connect(class, &mock);
    assert_eq!(driver.subsystem("hv").unwrap().get("level").unwrap(), Value::Float(1000.0));
    driver.call("hv_ramp", Args::new()).unwrap();
}

#[test]
fn test_nested_subsystem_follows_parent_enabling() {
    let class = ClassBody::new("Source")
        .subsystem("output", |ss| {
            ss.checks("driver.enabled == true")
                .feature("enabled", features::boolean().getter("OUTP?").setter("OUTP {}"))
                .subsystem("protection", |p| p.feature("limit", features::int().getter("PROT?")))
        })
        .build()
        .unwrap();
    let mock = Arc::new(
        MockBackend::new()
            .with_response("OUTP?", "0")
            .with_response("PROT?", "3"),
    );
    let driver = connect(class, &mock);
    let output = driver.subsystem("output").unwrap();
    let protection = output.subsystem("protection").unwrap();

    let err = protection.get("limit").unwrap_err();
    assert!(matches!(err, DaqError::Disabled { ref name, .. } if name == "limit"));

    mock.set_response("OUTP?", "1");
    output.clear_cache(true, true, None);
    assert_eq!(protection.get("limit").unwrap(), Value::Int(3));
}

#[test]
fn test_unit_return_setting() {
    let class = ClassBody::new("Source")
        .feature("volt", features::float().getter("VOLT?").setter("VOLT {}").unit("V"))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("VOLT?", "1.5"));
    let driver = connect(class, &mock);
    let root = driver.root();

    assert!(matches!(driver.get("volt").unwrap(), Value::Quantity(_)));
    root.set_setting("volt", "unit_return", false).unwrap();
    assert_eq!(driver.get("volt").unwrap(), Value::Float(1.5));
    assert_eq!(mock.get_count(), 1);

    let settings = root.read_settings("volt").unwrap();
    assert_eq!(settings.get("unit_return"), Some(&Value::Bool(false)));
}

#[test]
fn test_inter_set_delay() {
    let driver = connect(scope(), &Arc::new(MockBackend::new()));
    let root = driver.root();
    let _delay = root.temporary_setting("volt", "inter_set_delay", 0.05).unwrap();

    driver.set("volt", 1.0).unwrap();
    let start = Instant::now();
    driver.set("volt", 2.0).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test]
fn test_registry_reuses_connections() -> anyhow::Result<()> {
    let registry = DriverRegistry::new();
    let class = scope();
    let mock = Arc::new(MockBackend::new());

    let first = registry.get_or_create(&class, "TCPIP::10.0.0.2", DriverConfig::default(), || {
        Ok(mock.clone())
    })?;
    let same = registry.get_or_create(&class, "TCPIP::10.0.0.2", DriverConfig::default(), || {
        Ok(Arc::new(MockBackend::new()))
    })?;
    let other = registry.get_or_create(&class, "TCPIP::10.0.0.3", DriverConfig::default(), || {
        Ok(Arc::new(MockBackend::new()))
    })?;

    assert!(Arc::ptr_eq(&first, &same));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(registry.len(), 2);
    assert_eq!(first.connection_id(), "TCPIP::10.0.0.2");
    Ok(())
}

#[traced_test]
#[test]
fn test_retries_are_logged() {
    let class = ClassBody::new("Source")
        .feature("volt", features::float().getter("VOLT?").retries(1))
        .build()
        .unwrap();
    let mock = Arc::new(MockBackend::new().with_response("VOLT?", "1.0"));
    mock.fail_next(1, CommErrorKind::Timeout);
    let driver = connect(class, &mock);

    driver.get("volt").unwrap();
    assert!(logs_contain("communication failed, reopening connection"));
}

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (count.clone(), count)
}

#[test]
fn test_overridden_then_extended_stages_are_inherited() {
    let (pre_get_runs, pre_get_counter) = counter();
    let (post_set_runs, post_set_counter) = counter();
    let (log_runs, log_counter) = counter();
    let set_log = log_counter.clone();

    let base = ClassBody::new("Base")
        .feature(
            "volt",
            features::float()
                .getter("VOLT?")
                .setter("VOLT {}")
                .checks("driver.ok == true"),
        )
        .customize(
            "volt",
            "pre_get",
            Specifier::Override,
            "",
            FeatureFn::check(move |_, _| {
                pre_get_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .customize(
            "volt",
            "pre_get",
            Specifier::Append,
            "log",
            FeatureFn::check(move |_, _| {
                log_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .customize(
            "volt",
            "post_set",
            Specifier::Override,
            "",
            FeatureFn::inspect(move |_, _, _, _, _| {
                post_set_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .customize(
            "volt",
            "post_set",
            Specifier::Append,
            "log",
            FeatureFn::inspect(move |_, _, _, _, _| {
                set_log.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .build()
        .unwrap();
    let derived = ClassBody::new("Derived").base(&base).build().unwrap();

    let volt = base.feature("volt").unwrap();
    let copy = volt.clone_feature().unwrap();
    for stage in [FeatureStage::PreGet, FeatureStage::PostSet] {
        let expected = vec!["old".to_string(), "log".to_string()];
        assert_eq!(volt.stage(stage).names(), expected);
        assert_eq!(copy.stage(stage).names(), expected);
        assert_eq!(derived.feature("volt").unwrap().stage(stage).names(), expected);
    }

    for class in [base, derived] {
        let mock = Arc::new(MockBackend::new().with_response("VOLT?", "1.0"));
        mock.fail_check("-222, Data out of range");
        let driver = connect(class, &mock);
        assert_eq!(driver.get("volt").unwrap(), Value::Float(1.0));
        driver.set("volt", 2.0).unwrap();
        assert_eq!(mock.check_count(), 0);
    }
    assert_eq!(pre_get_runs.load(Ordering::SeqCst), 2);
    assert_eq!(post_set_runs.load(Ordering::SeqCst), 2);
    assert_eq!(log_runs.load(Ordering::SeqCst), 4);
}
