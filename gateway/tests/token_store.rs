//! Credential store behaviour across handles and processes sharing one file.

use std::sync::Arc;

use chatgate::middleware::auth::authenticate_caller;
use chatgate::models::token::CallerIdentity;
use chatgate::store::TokenStore;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_issue_authenticate_revoke_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::open(dir.path().join("tokens.json")).unwrap();

    let issued = store.issue("ci").await.unwrap();
    assert!(issued.secret.starts_with("sk-"));
    assert_eq!(issued.secret.len(), 3 + 64);
    assert!(issued.secret.starts_with(&issued.token.display_prefix));

    let found = store.authenticate(&issued.secret).await.unwrap().unwrap();
    assert_eq!(found.id, issued.token.id);
    assert_eq!(found.label, "ci");
    assert!(found.last_used_at.is_some());

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].last_used_at.is_some());

    assert!(store.revoke(&issued.token.id).await.unwrap());
    assert!(store.authenticate(&issued.secret).await.unwrap().is_none());
    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].active);

    assert!(store.delete(&issued.token.id).await.unwrap());
    assert!(store.list().await.unwrap().is_empty());
    assert!(!store.delete(&issued.token.id).await.unwrap());
}

#[tokio::test]
async fn test_secret_is_never_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    let store = TokenStore::open(&path).unwrap();
    let issued = store.issue("ops").await.unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains(&issued.secret));
    assert!(raw.contains(&issued.token.display_prefix));
}

#[tokio::test]
async fn test_tokens_issued_by_another_handle_are_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    let server = TokenStore::open(&path).unwrap();
    assert!(server.is_empty().await.unwrap());

    // Coarse mtime filesystems need a visible change.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let cli = TokenStore::open(&path).unwrap();
    let issued = cli.issue("from-cli").await.unwrap();

    let found = server.authenticate(&issued.secret).await.unwrap();
    assert_eq!(found.map(|t| t.label), Some("from-cli".to_string()));
}

#[tokio::test]
async fn test_reopen_keeps_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    let issued = {
        let store = TokenStore::open(&path).unwrap();
        store.issue("durable").await.unwrap()
    };

    let store = TokenStore::open(&path).unwrap();
    assert_ok!(store.get(&issued.token.id).await);
    assert!(store.authenticate(&issued.secret).await.unwrap().is_some());
}

#[tokio::test]
async fn test_corrupt_file_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    std::fs::write(&path, b"{not json").unwrap();
    assert!(TokenStore::open(&path).is_err());
}

#[tokio::test]
async fn test_concurrent_issue_loses_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::open(dir.path().join("tokens.json")).unwrap());

    let mut handles = Vec::new();
    for i in 0..20 {
        let s = store.clone();
        handles.push(tokio::spawn(async move { s.issue(&format!("t{}", i)).await }));
    }
    let mut secrets = Vec::new();
    for h in handles {
        secrets.push(h.await.unwrap().unwrap().secret);
    }

    assert_eq!(store.list().await.unwrap().len(), 20);
    let reopened = TokenStore::open(store.path()).unwrap();
    for secret in &secrets {
        assert!(reopened.authenticate(secret).await.unwrap().is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revoke_from_another_handle_survives_live_traffic() {
    for _ in 0..10 {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let server = Arc::new(TokenStore::open(&path).unwrap());
        let issued = server.issue("ci").await.unwrap();
        let cli = TokenStore::open(&path).unwrap();

        let traffic = {
            let server = server.clone();
            let secret = issued.secret.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    server.authenticate(&secret).await.unwrap();
                }
            })
        };
        assert!(cli.revoke(&issued.token.id).await.unwrap());
        traffic.await.unwrap();

        let reread = TokenStore::open(&path).unwrap();
        let record = reread.get(&issued.token.id).await.unwrap().unwrap();
        assert!(!record.active);
        assert!(server.authenticate(&issued.secret).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_delete_from_another_handle_is_not_resurrected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    let server = TokenStore::open(&path).unwrap();
    let keep = server.issue("keep").await.unwrap();
    let doomed = server.issue("doomed").await.unwrap();

    let cli = TokenStore::open(&path).unwrap();
    assert!(cli.delete(&doomed.token.id).await.unwrap());

    // The first hit on `keep` writes its stamp back against the file on disk.
    assert!(server.authenticate(&keep.secret).await.unwrap().is_some());
    let reread = TokenStore::open(&path).unwrap();
    assert!(reread.get(&doomed.token.id).await.unwrap().is_none());
    assert!(reread.get(&keep.token.id).await.unwrap().unwrap().last_used_at.is_some());
}

#[tokio::test]
async fn test_caller_modes() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::open(dir.path().join("tokens.json")).unwrap();

    // Nothing issued, no static key: open.
    assert_eq!(
        authenticate_caller(&store, None, None).await.unwrap(),
        CallerIdentity::Open
    );

    let issued = store.issue("ci").await.unwrap();
    assert_err!(authenticate_caller(&store, None, None).await);
    assert_err!(authenticate_caller(&store, None, Some("sk-wrong")).await);
    assert!(matches!(
        authenticate_caller(&store, None, Some(&issued.secret)).await.unwrap(),
        CallerIdentity::Token { ref label, .. } if label == "ci"
    ));

    // Revoking the last token does not reopen the gateway.
    store.revoke(&issued.token.id).await.unwrap();
    assert_err!(authenticate_caller(&store, None, None).await);
    assert_err!(authenticate_caller(&store, None, Some(&issued.secret)).await);
}
