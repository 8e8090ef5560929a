//! Example showing the tracing output of a full challenge against a mock key.
//!
//! Run with: cargo run -p keytap-core --example mock_touch

use std::sync::Arc;

use keytap_core::{
    AuthnResponse, FidoFactor, KeytapConfig, MockBehavior, MockCounters, MockEnumerator,
};
use tracing_subscriber::{fmt, EnvFilter};

const STATE: &str = r#"{
    "stateToken": "demo-state",
    "status": "MFA_CHALLENGE",
    "_embedded": {
        "factor": {
            "profile": {
                "credentialId": "ZGVtby1rZXktaGFuZGxl",
                "version": "U2F_V2",
                "appId": "https://login.example.com"
            },
            "_embedded": { "challenge": { "nonce": "ZGVtby1ub25jZQ" } }
        }
    }
}"#;

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::new("keytap_core=debug,info"))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    println!("=== Mock U2F Touch Demo ===\n");

    let counters = MockCounters::new();
    let factor = FidoFactor::new(
        Arc::new(MockEnumerator::single(MockBehavior::TouchAfter(4), counters.clone())),
        KeytapConfig::default(),
    );

    let authn: AuthnResponse = match serde_json::from_str(STATE) {
        Ok(authn) => authn,
        Err(e) => {
            eprintln!("Invalid state document: {}", e);
            return;
        }
    };

    match factor.verify(&authn).await {
        Ok((action, payload)) => {
            println!("\n=== Result ===");
            println!("Action: {}", action);
            println!("Payload: {}", String::from_utf8_lossy(&payload));
        }
        Err(e) => eprintln!("\n=== Error ===\n{}", e),
    }

    println!(
        "\nDevice calls: {} open, {} authenticate, {} close",
        counters.opens(),
        counters.authenticates(),
        counters.closes()
    );
}
