// Solo startup integration test
//
// A process with the registry disabled, talking only to itself through the
// loopback transport.

use meshbus::app::{AppCore, SendTarget};
use meshbus::config::AppConfig;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn solo_startup_self_send_round_trips_through_loopback() {
    let mut config = AppConfig::default();
    config.identity.id = 1;
    config.identity.name = "solo".into();
    config.etcd.enable = false;

    let mut app = AppCore::new(config);

    let received: Arc<Mutex<Vec<(i32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_cb = received.clone();
    app.on_forward_request(Arc::new(move |_sender, msg_type, _seq, payload, _metadata| {
        received_cb.lock().unwrap().push((msg_type, payload.to_vec()));
    }));

    assert_eq!(app.init().await.unwrap(), 0);

    app.send_message(SendTarget::Id(1), 7, b"hi".to_vec(), None)
        .await
        .expect("self-send should succeed with the registry disabled");

    for _ in 0..2 {
        app.tick().await.unwrap();
        if !received.lock().unwrap().is_empty() {
            break;
        }
    }

    let got = received.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, 7);
    assert_eq!(got[0].1, b"hi");
}
