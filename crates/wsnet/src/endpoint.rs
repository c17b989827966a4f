//! Broker URLs for the listen and connect sides.

use url::Url;

/// Where an agent listens for dialers, authenticated by its service token.
pub fn listen_endpoint(base: &Url, token: &str) -> Url {
    let mut url = websocket_base(base);
    url.set_path("/api/private/envagent/listen");
    url.query_pairs_mut().append_pair("service_token", token);
    url
}

/// Where a client dials the agent of `workspace`.
pub fn connect_endpoint(base: &Url, workspace: &str, token: &str) -> Url {
    let mut url = websocket_base(base);
    url.set_path(&format!("/api/private/envagent/{workspace}/connect"));
    url.query_pairs_mut().append_pair("session_token", token);
    url
}

fn websocket_base(base: &Url) -> Url {
    let mut url = base.clone();
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    // Non-special schemes cannot be switched and are left as given.
    let _ = url.set_scheme(scheme);
    url.set_query(None);
    url.set_fragment(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_listen_endpoint() {
        let base = Url::parse("https://coder.example.com").unwrap();
        assert_eq!(
            listen_endpoint(&base, "agent-token").as_str(),
            "wss://coder.example.com/api/private/envagent/listen?service_token=agent-token"
        );
    }

    #[test]
    fn builds_connect_endpoint() {
        let base = Url::parse("http://127.0.0.1:8080/ignored?x=1").unwrap();
        assert_eq!(
            connect_endpoint(&base, "ws-123", "a b").as_str(),
            "ws://127.0.0.1:8080/api/private/envagent/ws-123/connect?session_token=a+b"
        );
    }
}
