use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pgprovider::client::retry::Backoff;
use pgprovider::client::tunnel::ssh_args;
use pgprovider::config::JumpHost;

// ─── Backoff ─────────────────────────────────────────────────────────────────

#[test]
fn test_backoff_doubles_and_caps() {
    let backoff = Backoff::new(5, Duration::from_millis(100), Duration::from_millis(350));
    assert_eq!(backoff.delay(1), Duration::from_millis(100));
    assert_eq!(backoff.delay(2), Duration::from_millis(200));
    assert_eq!(backoff.delay(3), Duration::from_millis(350));
    assert_eq!(backoff.delay(40), Duration::from_millis(350));
}

#[tokio::test]
async fn test_backoff_retries_until_success() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let backoff = Backoff::new(3, Duration::from_millis(1), Duration::from_millis(1));
    let result: Result<u32, String> = backoff
        .run("flaky", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {} failed", n))
            } else {
                Ok(n)
            }
        })
        .await;
    assert_eq!(result, Ok(3));
}

#[tokio::test]
async fn test_backoff_returns_last_error() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let backoff = Backoff::new(2, Duration::from_millis(1), Duration::from_millis(1));
    let result: Result<(), String> = backoff
        .run("broken", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("attempt {}", n))
        })
        .await;
    assert_eq!(result, Err("attempt 3".to_string()));
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

// ─── SSH tunnel ──────────────────────────────────────────────────────────────

#[test]
fn test_ssh_args_forward_to_database() {
    let jump = JumpHost {
        host: "bastion.internal".to_string(),
        port: 2222,
        user: Some("ops".to_string()),
        private_key_file: Some(PathBuf::from("/keys/id_ed25519")),
    };
    let args = ssh_args(&jump, 40001, "db.internal", 5432);

    assert_eq!(args[0], "-N");
    assert!(args.contains(&"127.0.0.1:40001:db.internal:5432".to_string()));
    let port_at = args.iter().position(|a| a == "-p").unwrap();
    assert_eq!(args[port_at + 1], "2222");
    let key_at = args.iter().position(|a| a == "-i").unwrap();
    assert_eq!(args[key_at + 1], "/keys/id_ed25519");
    assert_eq!(args.last().unwrap(), "ops@bastion.internal");
}

#[test]
fn test_ssh_args_without_user_or_key() {
    let jump = JumpHost {
        host: "bastion".to_string(),
        port: 22,
        user: None,
        private_key_file: None,
    };
    let args = ssh_args(&jump, 40002, "db", 5432);
    assert!(!args.contains(&"-i".to_string()));
    assert_eq!(args.last().unwrap(), "bastion");
}
