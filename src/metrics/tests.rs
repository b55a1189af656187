use super::*;
use std::sync::atomic::{AtomicI64, Ordering};

struct Gauge {
    value: AtomicI64,
}

impl MetricsSource for Gauge {
    fn snapshot(&self) -> Vec<(String, MetricValue)> {
        vec![(
            "value".to_string(),
            MetricValue::Integer(self.value.load(Ordering::SeqCst)),
        )]
    }

    fn set(&self, property: &str, value: MetricValue) -> Result<()> {
        match (property, value.as_integer()) {
            ("value", Some(v)) => {
                self.value.store(v, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(TransferError::Config(format!("cannot set {}", property))),
        }
    }
}

#[test]
fn test_registration_is_scoped_to_guard() {
    let registry = Arc::new(InMemoryRegistry::new());
    let name = object_name("Task", "copy[0,10)");
    {
        let shared: Arc<dyn MetricsRegistry> = registry.clone();
        let _guard = Registration::new(
            shared,
            name.clone(),
            Arc::new(Gauge {
                value: AtomicI64::new(3),
            }),
        )
        .unwrap();
        assert!(registry.contains(&name));
        assert_eq!(registry.read(&name, "value"), Some(MetricValue::Integer(3)));
    }
    assert!(!registry.contains(&name));
    assert!(registry.names().is_empty());
}

#[test]
fn test_duplicate_names_are_rejected() {
    let registry = InMemoryRegistry::new();
    let gauge = Arc::new(Gauge {
        value: AtomicI64::new(0),
    });
    registry.register("a", gauge.clone()).unwrap();
    assert!(registry.register("a", gauge).is_err());
}

#[test]
fn test_writable_properties_go_through_the_registry() {
    let registry = InMemoryRegistry::new();
    let gauge = Arc::new(Gauge {
        value: AtomicI64::new(0),
    });
    registry.register("g", gauge.clone()).unwrap();
    registry.set("g", "value", MetricValue::from("12")).unwrap();
    assert_eq!(gauge.value.load(Ordering::SeqCst), 12);
    assert!(registry.set("missing", "value", 1u64.into()).is_err());
}

#[test]
fn test_noop_registry_accepts_everything() {
    let registry: Arc<dyn MetricsRegistry> = Arc::new(NoopRegistry);
    let guard = Registration::try_new(
        &registry,
        "anything",
        Arc::new(Gauge {
            value: AtomicI64::new(0),
        }),
    );
    assert_eq!(guard.map(|g| g.name().to_string()), Some("anything".to_string()));
}
