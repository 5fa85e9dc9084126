//! Tests for the default class handlers against real collaborators:
//! wiremock HTTP endpoints, the in-memory broker and sinks.

use serde_json::json;
use shop_worker::config::{NotificationsConfig, WorkersConfig};
use shop_worker::error::ErrorKind;
use shop_worker::handlers::{
    invoice::invoice_number, AnalyticsHandler, EmailHandler, FanoutNotificationHandler, HttpChannelSender,
    InAppStore, InMemoryAnalyticsSink, InvoiceHandler, NotificationHandler, PublishingInvoiceHandler,
    RecordingMailer, SinkAnalyticsHandler, TemplateEmailHandler, TemplateRegistry,
};
use shop_worker::jobs::{HandlerSet, JobContext};
use shop_worker::manager::WorkerManager;
use shop_worker::messaging::{
    AnalyticsEvent, Broker, EmailPayload, Envelope, InMemoryBroker, InvoiceItem, InvoicePayload, JobClass,
    NotificationChannel, NotificationPayload, Publisher,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn notifier(config: &NotificationsConfig) -> (FanoutNotificationHandler, Arc<InAppStore>) {
    let store = Arc::new(InAppStore::new());
    let sender = HttpChannelSender::new(config, store.clone()).unwrap();
    (FanoutNotificationHandler::new(Arc::new(sender)), store)
}

fn ctx(kind: &'static str) -> JobContext {
    JobContext::detached(format!("{}-job", kind), kind)
}

fn webhook(url: String) -> NotificationPayload {
    let mut headers = HashMap::new();
    headers.insert("X-Signature".to_string(), "sig-123".to_string());
    NotificationPayload {
        url: Some(url),
        method: Some("post".into()),
        headers: Some(headers),
        body: Some(json!({"order_id": "ord-1", "status": "shipped"})),
        ..NotificationPayload::new(NotificationChannel::Webhook)
    }
}

fn invoice_payload() -> InvoicePayload {
    InvoicePayload {
        order_id: "ord-77".into(),
        user_email: "buyer@shop.test".into(),
        order_number: "1077".into(),
        total_amount: 30.0,
        items: vec![
            InvoiceItem {
                product_name: "Mug".into(),
                quantity: 2,
                unit_price: 7.5,
                total_price: 15.0,
            },
            InvoiceItem {
                product_name: "Tea".into(),
                quantity: 3,
                unit_price: 5.0,
                total_price: 15.0,
            },
        ],
    }
}

// ============================================================================
// Email
// ============================================================================

fn manager_with_mailer(broker: Arc<InMemoryBroker>, mailer: Arc<RecordingMailer>) -> WorkerManager {
    let sink = Arc::new(InMemoryAnalyticsSink::new());
    let (notification, _) = notifier(&NotificationsConfig::default());
    let handlers = HandlerSet {
        email: Arc::new(TemplateEmailHandler::new(TemplateRegistry::default(), mailer)),
        invoice: Arc::new(PublishingInvoiceHandler::new(Publisher::new(broker.clone()))),
        notification: Arc::new(notification),
        analytics: Arc::new(SinkAnalyticsHandler::new(sink.clone(), sink)),
    };
    let config = WorkersConfig {
        email_workers: 1,
        invoice_workers: 1,
        notification_workers: 1,
        analytics_workers: 1,
        ..Default::default()
    };
    WorkerManager::new(config, broker, handlers)
}

#[tokio::test]
async fn test_permanent_smtp_rejection_is_validation_error() {
    let mailer = Arc::new(RecordingMailer::new());
    let handler = TemplateEmailHandler::new(TemplateRegistry::default(), mailer.clone());
    let email = EmailPayload::new("nobody@shop.test", "Welcome", "welcome");

    mailer.reject_next(1);
    let err = handler.handle(&email, &ctx("email")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);

    mailer.fail_next(1);
    let err = handler.handle(&email, &ctx("email")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientHandler);

    handler.handle(&email, &ctx("email")).await.unwrap();
    assert_eq!(mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_permanent_smtp_rejection_dead_letters_without_retry() {
    let broker = Arc::new(InMemoryBroker::new());
    let mailer = Arc::new(RecordingMailer::new());
    let manager = manager_with_mailer(broker.clone(), mailer.clone());
    manager.start().await.unwrap();

    mailer.reject_next(1);
    let email = EmailPayload::new("nobody@shop.test", "Welcome", "welcome");
    let envelope = Envelope::from_record(JobClass::Email, &email, 3).unwrap();
    broker.publish("email_queue", &envelope).await.unwrap();

    assert!(
        broker
            .wait_until("email_queue", Duration::from_secs(5), |c| c.dead_lettered == 1)
            .await
    );
    let counters = broker.counters("email_queue");
    assert_eq!(counters.requeued, 0);
    assert_eq!(counters.delivered, 1);
    assert_eq!(broker.dead_letters("email_queue").len(), 1);
    assert!(mailer.sent().is_empty());

    manager.stop().await.unwrap();
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test]
async fn test_webhook_sent_with_method_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/order"))
        .and(header("X-Signature", "sig-123"))
        .and(body_json(json!({"order_id": "ord-1", "status": "shipped"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let (handler, _) = notifier(&NotificationsConfig::default());
    let payload = webhook(format!("{}/hooks/order", server.uri()));
    handler.handle(&payload, &ctx("notification")).await.unwrap();
}

#[tokio::test]
async fn test_failed_webhook_alone_fails_handler() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let (handler, _) = notifier(&NotificationsConfig::default());
    let payload = webhook(format!("{}/hooks/order", server.uri()));
    let err = handler.handle(&payload, &ctx("notification")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientHandler);
}

#[tokio::test]
async fn test_one_successful_channel_is_enough() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let (handler, store) = notifier(&NotificationsConfig::default());
    let payload = NotificationPayload {
        channels: vec![NotificationChannel::InApp],
        user_id: Some("u-9".into()),
        title: Some("Order shipped".into()),
        message: Some("Your order is on its way".into()),
        ..webhook(format!("{}/hooks/order", server.uri()))
    };

    handler.handle(&payload, &ctx("notification")).await.unwrap();
    let inbox = store.notifications_for("u-9");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].title, "Order shipped");
}

#[tokio::test]
async fn test_push_goes_through_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push"))
        .and(body_json(json!({
            "user_id": "u-1",
            "title": "Sale",
            "body": "50% off today",
            "data": {"campaign": "spring"}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = NotificationsConfig {
        push_gateway_url: Some(format!("{}/push", server.uri())),
        ..Default::default()
    };
    let (handler, _) = notifier(&config);

    let mut data = serde_json::Map::new();
    data.insert("campaign".into(), json!("spring"));
    let payload = NotificationPayload {
        user_id: Some("u-1".into()),
        title: Some("Sale".into()),
        body: Some(json!("50% off today")),
        data: Some(data),
        ..NotificationPayload::new(NotificationChannel::PushNotification)
    };
    handler.handle(&payload, &ctx("notification")).await.unwrap();
}

#[tokio::test]
async fn test_sms_without_gateway_fails() {
    let (handler, _) = notifier(&NotificationsConfig::default());
    let payload = NotificationPayload {
        phone_number: Some("+15550100".into()),
        message: Some("Your code is 1234".into()),
        ..NotificationPayload::new(NotificationChannel::Sms)
    };
    let err = handler.handle(&payload, &ctx("notification")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientHandler);
}

#[tokio::test]
async fn test_missing_primary_fields_is_validation_error() {
    let (handler, _) = notifier(&NotificationsConfig::default());
    let payload = NotificationPayload::new(NotificationChannel::InApp);
    let err = handler.handle(&payload, &ctx("notification")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
}

// ============================================================================
// Analytics
// ============================================================================

#[tokio::test]
async fn test_analytics_redelivery_is_idempotent() {
    let sink = Arc::new(InMemoryAnalyticsSink::new());
    let handler = SinkAnalyticsHandler::new(sink.clone(), sink.clone());
    let event = AnalyticsEvent::new("evt-42", "purchase", "checkout_completed").with_property("value", 30.0);

    handler.handle(&event, &ctx("analytics")).await.unwrap();
    handler.handle(&event, &ctx("analytics")).await.unwrap();

    assert_eq!(sink.len(), 1);
    assert_eq!(sink.count("purchase"), 1);
    assert_eq!(sink.get("evt-42").unwrap().event_name, "checkout_completed");
}

#[tokio::test]
async fn test_analytics_stale_event_and_unavailable_sink() {
    let sink = Arc::new(InMemoryAnalyticsSink::new());
    let handler = SinkAnalyticsHandler::new(sink.clone(), sink.clone());

    let stale = AnalyticsEvent::new("evt-old", "page", "view")
        .with_timestamp(chrono::Utc::now() - chrono::Duration::hours(25));
    let err = handler.handle(&stale, &ctx("analytics")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);

    sink.set_available(false);
    let fresh = AnalyticsEvent::new("evt-new", "page", "view");
    let err = handler.handle(&fresh, &ctx("analytics")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientHandler);
    assert!(sink.is_empty());
}

// ============================================================================
// Invoice
// ============================================================================

#[tokio::test]
async fn test_invoice_publishes_deterministic_email() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.setup().await.unwrap();
    let handler = PublishingInvoiceHandler::new(Publisher::new(broker.clone()));

    handler.handle(&invoice_payload(), &ctx("invoice")).await.unwrap();
    handler.handle(&invoice_payload(), &ctx("invoice")).await.unwrap();

    assert_eq!(broker.counters("email_queue").published, 2);
    let number = invoice_number("1077", "ord-77");
    assert!(number.starts_with("INV-1077-"));
    assert_eq!(number.len(), "INV-1077-".len() + 8);
}

#[tokio::test]
async fn test_invoice_arithmetic_mismatch_is_validation_error() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.setup().await.unwrap();
    let handler = PublishingInvoiceHandler::new(Publisher::new(broker.clone()));

    let mut payload = invoice_payload();
    payload.total_amount = 99.0;
    let err = handler.handle(&payload, &ctx("invoice")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert_eq!(broker.counters("email_queue").published, 0);
}

#[tokio::test]
async fn test_invoice_flows_into_email_pipeline() {
    let broker = Arc::new(InMemoryBroker::new());
    let mailer = Arc::new(RecordingMailer::new());
    let manager = manager_with_mailer(broker.clone(), mailer.clone());
    manager.start().await.unwrap();

    let envelope = Envelope::from_record(JobClass::Invoice, &invoice_payload(), 3).unwrap();
    broker.publish("invoice_queue", &envelope).await.unwrap();

    assert!(
        broker
            .wait_until("email_queue", Duration::from_secs(5), |c| c.acked == 1)
            .await
    );
    assert_eq!(broker.counters("invoice_queue").acked, 1);

    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "buyer@shop.test");
    assert_eq!(sent[0].subject, format!("Invoice {}", invoice_number("1077", "ord-77")));
    // 30.00 subtotal, 2.40 tax, 5.99 shipping
    assert!(sent[0].html_body.contains("Total: 38.39"));

    manager.stop().await.unwrap();
}
