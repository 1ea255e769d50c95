use super::*;

#[test]
fn ws_url_maps_http_schemes() {
    let plain = ClientConfig::new("http://127.0.0.1:3000/");
    assert_eq!(plain.ws_url("t1").expect("ws url"), "ws://127.0.0.1:3000/api/ws?ticket=t1");

    let tls = ClientConfig::new("https://boards.example.com");
    assert_eq!(tls.ws_url("t2").expect("ws url"), "wss://boards.example.com/api/ws?ticket=t2");
}

#[test]
fn ws_url_rejects_other_schemes() {
    let config = ClientConfig::new("ftp://nope");
    assert!(matches!(config.ws_url("t"), Err(ClientError::InvalidBaseUrl(_))));
}

#[test]
fn api_url_joins_without_double_slash() {
    let config = ClientConfig::new("http://host:3000/");
    assert_eq!(config.api_url("/api/rooms/b1/grant"), "http://host:3000/api/rooms/b1/grant");
}

#[test]
fn backoff_doubles_up_to_cap() {
    let policy = ReconnectPolicy::default();
    assert_eq!(policy.delay(1), Duration::from_millis(1000));
    assert_eq!(policy.delay(2), Duration::from_millis(2000));
    assert_eq!(policy.delay(3), Duration::from_millis(4000));
    assert_eq!(policy.delay(5), Duration::from_millis(10_000));
    assert_eq!(policy.delay(40), Duration::from_millis(10_000));
}

#[test]
fn attempt_budget() {
    let policy = ReconnectPolicy { max_attempts: Some(2), ..ReconnectPolicy::default() };
    assert!(policy.allows(1));
    assert!(policy.allows(2));
    assert!(!policy.allows(3));

    assert!(!ReconnectPolicy::disabled().allows(1));
    assert!(ReconnectPolicy { max_attempts: None, ..ReconnectPolicy::default() }.allows(u32::MAX));
}
