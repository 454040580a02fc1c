mod common;

use serde_json::json;
use std::sync::Arc;

use common::{BrokerOptions, MockBroker};
use sepa_client::credentials::MemoryStorage;
use sepa_client::{Bindings, ClientSettings, SepaClient, SepaError};

async fn client(mock: &MockBroker) -> SepaClient {
    SepaClient::new(Arc::new(mock.configuration()), ClientSettings::default())
        .unwrap()
        .with_credentials(MemoryStorage::new())
        .unwrap()
}

#[tokio::test]
async fn queries_post_the_rendered_text() {
    let mock = MockBroker::start(BrokerOptions::default()).await;
    let client = client(&mock).await;
    let response = client
        .query("name_of", &Bindings::new().bind("person", "ex:alice"), false)
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.payload["head"]["vars"], json!(["s", "p", "o"]));

    let requests = mock.broker.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/query");
    assert_eq!(requests[0].content_type.as_deref(), Some("application/sparql-query"));
    assert_eq!(requests[0].authorization, None);
    assert_eq!(
        requests[0].body,
        "PREFIX ex: <http://ex.org/> SELECT ?name WHERE { ex:alice ex:name ?name }"
    );
}

#[tokio::test]
async fn updates_use_the_update_content_type() {
    let mock = MockBroker::start(BrokerOptions::default()).await;
    let client = client(&mock).await;
    let bindings = Bindings::new().bind("person", "http://people/bob").bind("name", "Bob");
    let response = client.update("set_name", &bindings, false).await.unwrap();
    assert!(response.success);

    let requests = mock.broker.requests();
    assert_eq!(requests[0].path, "/update");
    assert_eq!(requests[0].content_type.as_deref(), Some("application/sparql-update"));
    assert!(requests[0].body.ends_with("INSERT DATA { <http://people/bob> ex:name 'Bob' . }"));
}

#[tokio::test]
async fn broker_errors_come_back_as_failures() {
    let mock = MockBroker::start(BrokerOptions::default()).await;
    let client = client(&mock).await;
    let response = client.query("broken", &Bindings::new(), false).await.unwrap();
    assert!(!response.success);
    assert_eq!(response.payload, json!("parse error"));
}

#[tokio::test]
async fn unknown_names_send_nothing() {
    let mock = MockBroker::start(BrokerOptions::default()).await;
    let client = client(&mock).await;
    assert!(matches!(
        client.query("missing", &Bindings::new(), false).await,
        Err(SepaError::TemplateNotFound { .. })
    ));
    assert!(matches!(
        client.update("missing", &Bindings::new(), true).await,
        Err(SepaError::TemplateNotFound { .. })
    ));
    assert!(mock.broker.requests().is_empty());
}
