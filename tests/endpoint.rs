//! Endpoint Integration Tests
//!
//! Tests for starting endpoints with the built-in features and running
//! messages through the receive and send pipelines end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use sagabus::config::ResolvedConfig;
use sagabus::core::{
    feature_name, Behavior, BreakerState, CircuitBreakerSettings, ContextBag, ContextKind, FeatureState,
    HandlerContext, MessageHandler, Next, OutgoingLogicalMessageContext, PipelineContext, ProcessingOutcome,
};
use sagabus::domain::headers;
use sagabus::features::{
    DispatchFeature, InMemoryDispatcher, InMemorySagaPersistenceFeature, ManageUnitsOfWork, MessageDispatcher,
    MessageMutators, MutateOutgoingMessages, ReceiveFeature, SagasFeature, UnitOfWorkManagers,
};
use sagabus::sagas::{ActiveSaga, SagaHandler, SagaInstance, SagaPersistenceError, TypeCatalog, TypeExpr};
use sagabus::{Endpoint, EndpointConfiguration, IncomingMessage, LogicalMessage, SagaCatalog, SagaPersister};

type Journal = Arc<Mutex<Vec<String>>>;

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// No backoff so failing tests do not sleep
fn quiet_breaker() -> CircuitBreakerSettings {
    CircuitBreakerSettings {
        time_to_wait_seconds: 120,
        failure_backoff_millis: 0,
    }
}

fn configuration() -> EndpointConfiguration {
    let mut configuration = EndpointConfiguration::new("Sales");
    configuration.circuit_breaker(quiet_breaker());
    configuration
}

fn message(message_type: &str, body: Value) -> IncomingMessage {
    IncomingMessage::json(message_type, &body).unwrap()
}

struct RecordingHandler {
    name: &'static str,
    journal: Journal,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    fn name(&self) -> &str {
        self.name
    }

    async fn handle(&self, message: &LogicalMessage, context: &mut HandlerContext<'_>) -> Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, message.message_type));

        if message.property("Stop") == json!(true) {
            context.do_not_continue_dispatching_current_message_to_handlers();
        }
        if message.property("Fail") == json!(true) {
            bail!("{} rejected the message", self.name);
        }
        Ok(())
    }
}

fn recording(name: &'static str, journal: &Journal) -> RecordingHandler {
    RecordingHandler {
        name,
        journal: journal.clone(),
    }
}

struct OrderSaga {
    journal: Journal,
}

#[async_trait]
impl SagaHandler for OrderSaga {
    async fn handle(
        &self,
        message: &LogicalMessage,
        saga: &mut ActiveSaga,
        _context: &mut HandlerContext<'_>,
    ) -> Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{} new={}", message.message_type, saga.is_new()));

        match message.message_type.as_str() {
            "StartOrder" => saga.data_mut().set("Status", "Started"),
            "ShipOrder" => saga.data_mut().set("Status", "Shipped"),
            "CompleteOrder" => saga.mark_as_complete(),
            other => bail!("OrderSaga does not handle {}", other),
        }
        Ok(())
    }
}

fn order_sagas(journal: &Journal) -> SagaCatalog {
    let mut types = TypeCatalog::new();
    let wk = types.well_known();

    let data = types
        .define("OrderData")
        .extends(wk.contain_saga_data)
        .member("OrderId", wk.string)
        .member("Status", wk.string)
        .key();
    let start = types
        .define("StartOrder")
        .implements(wk.command)
        .member("OrderId", wk.string)
        .key();
    let ship = types
        .define("ShipOrder")
        .implements(wk.command)
        .member("OrderId", wk.string)
        .key();
    let complete = types
        .define("CompleteOrder")
        .implements(wk.command)
        .member("OrderId", wk.string)
        .key();
    let saga = types
        .define("OrderSaga")
        .extends(TypeExpr::generic(wk.saga, [data.into()]))
        .implements(TypeExpr::generic(wk.started_by, [start.into()]))
        .implements(TypeExpr::generic(wk.handles, [ship.into()]))
        .implements(TypeExpr::generic(wk.handles, [complete.into()]))
        .configure_how_to_find_saga(|m| {
            m.configure_mapping(start, "OrderId").to_saga("OrderId");
            m.configure_mapping(ship, "OrderId").to_saga("OrderId");
            m.configure_mapping(complete, "OrderId").to_saga("OrderId");
        })
        .key();

    let mut catalog = SagaCatalog::new(types);
    catalog.register_saga(
        saga,
        OrderSaga {
            journal: journal.clone(),
        },
    );
    catalog
}

async fn find_order(persister: &dyn SagaPersister, order_id: &str) -> Option<SagaInstance> {
    persister
        .get_by_property("OrderData", "OrderId", &json!(order_id), &ContextBag::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_builtin_features_without_dispatcher_or_sagas() {
    let endpoint = Endpoint::start(configuration()).await.unwrap();
    let report = endpoint.activation_report();

    assert!(report.is_active(&feature_name::<ReceiveFeature>()));

    match report.state(&feature_name::<DispatchFeature>()) {
        Some(FeatureState::PrerequisitesNotMet { reasons }) => {
            assert_eq!(reasons, &vec!["A message dispatcher has been registered".to_string()]);
        }
        other => panic!("Unexpected dispatch state: {:?}", other),
    }
    assert!(matches!(
        report.state(&feature_name::<SagasFeature>()),
        Some(FeatureState::PrerequisitesNotMet { .. })
    ));
    assert!(matches!(
        report.state(&feature_name::<InMemorySagaPersistenceFeature>()),
        Some(FeatureState::DependenciesNotMet { .. })
    ));

    assert_eq!(
        endpoint.settings().get::<String>("EndpointName").unwrap(),
        Some("Sales".to_string())
    );
    assert_eq!(endpoint.receive_pipeline().root(), ContextKind::TransportReceive);
    assert!(endpoint.send_pipeline().steps().is_empty());

    let err = assert_err!(
        endpoint
            .send(OutgoingLogicalMessageContext::new(LogicalMessage::new("OrderAccepted", json!({}))))
            .await
    );
    assert!(err.to_string().contains("Dispatch"));

    assert_ok!(endpoint.stop().await);
}

#[tokio::test]
async fn test_all_builtin_features_activate_in_dependency_order() {
    let journal = journal();
    let mut configuration = configuration();
    configuration
        .use_sagas(order_sagas(&journal))
        .use_dispatcher(Arc::new(InMemoryDispatcher::new()));

    let endpoint = Endpoint::start(configuration).await.unwrap();
    let report = endpoint.activation_report();

    let receive = report.position(&feature_name::<ReceiveFeature>()).unwrap();
    let sagas = report.position(&feature_name::<SagasFeature>()).unwrap();
    let persistence = report
        .position(&feature_name::<InMemorySagaPersistenceFeature>())
        .unwrap();
    assert!(report.is_active(&feature_name::<DispatchFeature>()));
    assert!(receive < sagas);
    assert!(sagas < persistence);

    assert!(endpoint.components().contains::<Arc<dyn SagaPersister>>());
    assert!(!endpoint.send_pipeline().steps().is_empty());
}

#[tokio::test]
async fn test_config_can_disable_builtin_features() {
    let mut config = ResolvedConfig::default();
    config.endpoint_name = "Billing".to_string();
    config.features.disable.push(feature_name::<ReceiveFeature>());
    config.circuit_breaker = quiet_breaker();

    let journal = journal();
    let mut configuration = EndpointConfiguration::from_config(&config).unwrap();
    configuration.use_sagas(order_sagas(&journal));

    let endpoint = Endpoint::start(configuration).await.unwrap();
    let report = endpoint.activation_report();

    assert_eq!(endpoint.name(), "Billing");
    assert_eq!(
        report.state(&feature_name::<ReceiveFeature>()),
        Some(&FeatureState::Disabled)
    );
    assert!(matches!(
        report.state(&feature_name::<SagasFeature>()),
        Some(FeatureState::DependenciesNotMet { .. })
    ));
    assert!(endpoint.receive_pipeline().steps().is_empty());
}

#[tokio::test]
async fn test_saga_lifecycle_end_to_end() {
    let journal = journal();
    let mut configuration = configuration();
    configuration.use_sagas(order_sagas(&journal));

    let endpoint = Endpoint::start(configuration).await.unwrap();
    let persister = endpoint
        .components()
        .get::<Arc<dyn SagaPersister>>()
        .cloned()
        .expect("in-memory persister registered");

    let start = message("StartOrder", json!({ "OrderId": "order-1" }))
        .with_header(headers::REPLY_TO_ADDRESS, "Shipping");
    let start_id = start.message_id.clone();
    let outcome = assert_ok!(endpoint.process(start).await);
    assert_eq!(outcome, ProcessingOutcome::Completed);

    let started = find_order(persister.as_ref(), "order-1").await.expect("saga created");
    assert_eq!(started.entity.get("Status"), json!("Started"));
    assert_eq!(started.entity.originator.as_deref(), Some("Shipping"));
    assert_eq!(started.entity.original_message_id, Some(start_id));

    assert_ok!(endpoint.process(message("ShipOrder", json!({ "OrderId": "order-1" }))).await);
    let shipped = find_order(persister.as_ref(), "order-1").await.expect("saga still running");
    assert_eq!(shipped.id(), started.id());
    assert_eq!(shipped.entity.get("Status"), json!("Shipped"));

    assert_ok!(endpoint.process(message("CompleteOrder", json!({ "OrderId": "order-1" }))).await);
    assert!(find_order(persister.as_ref(), "order-1").await.is_none());

    assert_eq!(
        entries(&journal),
        vec!["StartOrder new=true", "ShipOrder new=false", "CompleteOrder new=false"]
    );
}

#[tokio::test]
async fn test_message_for_missing_saga_is_ignored() {
    let journal = journal();
    let mut configuration = configuration();
    configuration.use_sagas(order_sagas(&journal));

    let endpoint = Endpoint::start(configuration).await.unwrap();
    let persister = endpoint
        .components()
        .get::<Arc<dyn SagaPersister>>()
        .cloned()
        .unwrap();

    let outcome = assert_ok!(endpoint.process(message("ShipOrder", json!({ "OrderId": "unknown" }))).await);
    assert_eq!(outcome, ProcessingOutcome::Completed);
    assert!(find_order(persister.as_ref(), "unknown").await.is_none());
    assert!(entries(&journal).is_empty());
}

#[tokio::test]
async fn test_null_correlation_value_fails_processing() {
    let journal = journal();
    let mut configuration = configuration();
    configuration.use_sagas(order_sagas(&journal));

    let endpoint = Endpoint::start(configuration).await.unwrap();
    let err = assert_err!(endpoint.process(message("StartOrder", json!({}))).await);

    assert!(format!("{:#}", err).contains("cannot be assigned null"));
    assert!(entries(&journal).is_empty());
}

/// Store that accepts everything and finds nothing
#[derive(Default)]
struct CountingPersister {
    saves: AtomicUsize,
}

#[async_trait]
impl SagaPersister for CountingPersister {
    async fn save(&self, _saga: &mut SagaInstance, _context: &ContextBag) -> Result<(), SagaPersistenceError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, _saga: &mut SagaInstance, _context: &ContextBag) -> Result<(), SagaPersistenceError> {
        Ok(())
    }

    async fn get(
        &self,
        _entity_type: &str,
        _saga_id: Uuid,
        _context: &ContextBag,
    ) -> Result<Option<SagaInstance>, SagaPersistenceError> {
        Ok(None)
    }

    async fn get_by_property(
        &self,
        _entity_type: &str,
        _property: &str,
        _value: &Value,
        _context: &ContextBag,
    ) -> Result<Option<SagaInstance>, SagaPersistenceError> {
        Ok(None)
    }

    async fn complete(&self, _saga_id: Uuid, _context: &ContextBag) -> Result<(), SagaPersistenceError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_custom_saga_persister_replaces_in_memory_store() {
    let journal = journal();
    let persister = Arc::new(CountingPersister::default());
    let mut configuration = configuration();
    configuration
        .use_sagas(order_sagas(&journal))
        .use_saga_persister(persister.clone());

    let endpoint = Endpoint::start(configuration).await.unwrap();
    assert!(matches!(
        endpoint
            .activation_report()
            .state(&feature_name::<InMemorySagaPersistenceFeature>()),
        Some(FeatureState::PrerequisitesNotMet { .. })
    ));

    assert_ok!(endpoint.process(message("StartOrder", json!({ "OrderId": "order-1" }))).await);
    assert_ok!(endpoint.process(message("StartOrder", json!({ "OrderId": "order-2" }))).await);
    assert_eq!(persister.saves.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_handlers_run_in_registration_order_and_can_stop_dispatch() {
    let journal = journal();
    let mut configuration = configuration();
    configuration
        .register_handler("PlaceOrder", recording("audit", &journal))
        .register_handler("PlaceOrder", recording("billing", &journal))
        .register_handler("CancelOrder", recording("cancel", &journal));

    let endpoint = Endpoint::start(configuration).await.unwrap();

    assert_ok!(endpoint.process(message("PlaceOrder", json!({}))).await);
    assert_eq!(entries(&journal), vec!["audit:PlaceOrder", "billing:PlaceOrder"]);

    journal.lock().unwrap().clear();
    assert_ok!(endpoint.process(message("PlaceOrder", json!({ "Stop": true }))).await);
    assert_eq!(entries(&journal), vec!["audit:PlaceOrder"]);
}

#[tokio::test]
async fn test_unhandled_message_fails_and_arms_the_breaker() {
    let journal = journal();
    let mut configuration = configuration();
    configuration.register_handler("PlaceOrder", recording("audit", &journal));

    let endpoint = Endpoint::start(configuration).await.unwrap();
    assert_eq!(endpoint.circuit_breaker_state(), BreakerState::Disarmed);

    let err = assert_err!(endpoint.process(message("RefundOrder", json!({}))).await);
    assert!(format!("{:#}", err).contains("No handlers could be found for message type: RefundOrder"));
    assert_eq!(endpoint.circuit_breaker_state(), BreakerState::Armed);

    assert_ok!(endpoint.process(message("PlaceOrder", json!({}))).await);
    assert_eq!(endpoint.circuit_breaker_state(), BreakerState::Disarmed);
}

#[tokio::test]
async fn test_control_message_skips_handlers() {
    let journal = journal();
    let mut configuration = configuration();
    configuration.register_handler("PlaceOrder", recording("audit", &journal));

    let endpoint = Endpoint::start(configuration).await.unwrap();
    let control = IncomingMessage::new("native-1", HashMap::new(), Vec::new());

    let outcome = assert_ok!(endpoint.process(control).await);
    assert_eq!(outcome, ProcessingOutcome::Completed);
    assert!(entries(&journal).is_empty());
}

/// Rejects messages flagged as poison before they are deserialized
struct PoisonFilter;

#[async_trait]
impl Behavior for PoisonFilter {
    fn stage(&self) -> ContextKind {
        ContextKind::IncomingPhysical
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let physical = context.as_incoming_physical()?;
        if physical.message.header("Poison").is_some() {
            physical.abort_receive_operation();
            return Ok(());
        }
        next.run(context).await
    }
}

#[tokio::test]
async fn test_abort_is_reported_to_the_transport() {
    let journal = journal();
    let mut configuration = configuration();
    configuration.register_handler("PlaceOrder", recording("audit", &journal));
    configuration
        .pipeline()
        .register("PoisonFilter", PoisonFilter, "Aborts poison messages")
        .unwrap();

    let endpoint = Endpoint::start(configuration).await.unwrap();

    let poison = message("PlaceOrder", json!({})).with_header("Poison", "yes");
    assert_eq!(assert_ok!(endpoint.process(poison).await), ProcessingOutcome::Aborted);
    assert!(entries(&journal).is_empty());

    assert_eq!(
        assert_ok!(endpoint.process(message("PlaceOrder", json!({}))).await),
        ProcessingOutcome::Completed
    );
    assert_eq!(entries(&journal), vec!["audit:PlaceOrder"]);
}

struct RecordingUnitOfWork {
    name: &'static str,
    journal: Journal,
}

#[async_trait]
impl ManageUnitsOfWork for RecordingUnitOfWork {
    async fn begin(&self, _extensions: &ContextBag) -> Result<()> {
        self.journal.lock().unwrap().push(format!("{}:begin", self.name));
        Ok(())
    }

    async fn end(&self, error: Option<&anyhow::Error>, _extensions: &ContextBag) -> Result<()> {
        let outcome = if error.is_some() { "failed" } else { "ok" };
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:end:{}", self.name, outcome));
        Ok(())
    }
}

#[tokio::test]
async fn test_units_of_work_wrap_handlers() {
    let journal = journal();
    let mut configuration = configuration();
    configuration.register_handler("PlaceOrder", recording("audit", &journal));
    configuration
        .components()
        .get_or_insert_default::<UnitOfWorkManagers>()
        .add(RecordingUnitOfWork {
            name: "outer",
            journal: journal.clone(),
        })
        .add(RecordingUnitOfWork {
            name: "inner",
            journal: journal.clone(),
        });

    let endpoint = Endpoint::start(configuration).await.unwrap();

    assert_ok!(endpoint.process(message("PlaceOrder", json!({}))).await);
    assert_eq!(
        entries(&journal),
        vec![
            "outer:begin",
            "inner:begin",
            "audit:PlaceOrder",
            "inner:end:ok",
            "outer:end:ok"
        ]
    );

    journal.lock().unwrap().clear();
    let err = assert_err!(endpoint.process(message("PlaceOrder", json!({ "Fail": true }))).await);
    assert!(err.to_string().contains("audit rejected the message"));
    assert_eq!(
        entries(&journal),
        vec![
            "outer:begin",
            "inner:begin",
            "audit:PlaceOrder",
            "inner:end:failed",
            "outer:end:failed"
        ]
    );
}

struct StampTenant;

impl MutateOutgoingMessages for StampTenant {
    fn mutate_outgoing(&self, _message: &mut LogicalMessage, headers: &mut HashMap<String, String>) -> Result<()> {
        headers.insert("Tenant".to_string(), "acme".to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_send_serializes_and_dispatches() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let mut configuration = configuration();
    configuration.use_dispatcher(dispatcher.clone() as Arc<dyn MessageDispatcher>);
    configuration
        .components()
        .get_or_insert_default::<MessageMutators>()
        .add_outgoing(StampTenant);

    let endpoint = Endpoint::start(configuration).await.unwrap();

    let mut outgoing =
        OutgoingLogicalMessageContext::new(LogicalMessage::new("OrderAccepted", json!({ "OrderId": "order-1" })));
    outgoing.set_header(headers::CORRELATION_ID, "corr-1");
    let message_id = outgoing.message_id.clone();
    assert_ok!(endpoint.send(outgoing).await);

    let sent = dispatcher.take();
    assert_eq!(sent.len(), 1);
    let dispatched = &sent[0];

    assert_eq!(dispatched.message_id, message_id);
    assert_eq!(dispatched.headers.get(headers::MESSAGE_ID), Some(&message_id));
    assert_eq!(
        dispatched.headers.get(headers::ENCLOSED_MESSAGE_TYPES).map(String::as_str),
        Some("OrderAccepted")
    );
    assert_eq!(dispatched.headers.get(headers::CORRELATION_ID).map(String::as_str), Some("corr-1"));
    assert_eq!(dispatched.headers.get("Tenant").map(String::as_str), Some("acme"));

    let body: Value = serde_json::from_slice(&dispatched.body).unwrap();
    assert_eq!(body, json!({ "OrderId": "order-1" }));
    assert!(dispatcher.sent().is_empty());
}
