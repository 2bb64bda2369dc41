//! Concurrent first use of a TCP session key

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tunnelbus_registry::{SessionRegistry, SharePortKey, TcpSession};

#[tokio::test]
async fn test_one_backing_connection_per_triple() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_clone = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            accepted_clone.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });

    let registry: Arc<SessionRegistry<Arc<()>>> = Arc::new(SessionRegistry::new());
    let key = SharePortKey::new("user1", 8080, "conn-1");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .share_port_sessions()
                .get_or_try_create(key, || async {
                    let stream = TcpStream::connect(addr).await?;
                    Ok::<_, std::io::Error>(Arc::new(TcpSession::new(stream)?))
                })
                .await
                .unwrap()
        }));
    }

    let mut sessions = Vec::new();
    let mut creators = 0;
    for task in tasks {
        let (session, created) = task.await.unwrap();
        if created {
            creators += 1;
        }
        sessions.push(session);
    }

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(creators, 1);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(registry.share_port_sessions().len(), 1);
}

#[tokio::test]
async fn test_distinct_triples_get_distinct_sessions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let registry: SessionRegistry<Arc<()>> = SessionRegistry::new();
    let connect = || async {
        let stream = TcpStream::connect(addr).await?;
        Ok::<_, std::io::Error>(Arc::new(TcpSession::new(stream)?))
    };

    let (a, _) = registry
        .share_port_sessions()
        .get_or_try_create(SharePortKey::new("user1", 8080, "conn-1"), connect)
        .await
        .unwrap();
    let (b, _) = registry
        .share_port_sessions()
        .get_or_try_create(SharePortKey::new("user2", 8080, "conn-1"), connect)
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(registry.share_port_sessions().len(), 2);
}
