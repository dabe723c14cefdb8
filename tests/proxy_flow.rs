// End-to-end forwarding through a running service graph
mod common;

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use ccenv::{
        ServiceGraph, SessionTracker,
        config::{Credential, RoutingStrategy},
    };
    use futures_util::StreamExt;
    use serde_json::Value;

    use crate::common::{Behavior, FakeUpstream, http, provider, snapshot};

    const MESSAGES_BODY: &str =
        r#"{"model":"claude-3-5-sonnet","max_tokens":1024,"messages":[{"role":"user","content":"hi"}],"stream":false}"#;

    async fn start(snapshot: ccenv::config::ConfigSnapshot) -> ServiceGraph {
        ServiceGraph::start(Arc::new(snapshot), Arc::new(SessionTracker::new()))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_provider_available_never_calls_upstream() {
        let upstream = FakeUpstream::spawn(Behavior::Echo).await;
        let mut off = provider("off", &upstream.url(), Credential::Bearer("sk-1".into()));
        off.enabled = false;
        let graph = start(snapshot(RoutingStrategy::Failover, vec![off])).await;

        let response = http()
            .post(format!("http://{}/v1/messages", graph.api_addr()))
            .body(MESSAGES_BODY)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);

        let json: Value = response.json().await.unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "overloaded_error");
        assert_eq!(upstream.hits(), 0);

        graph.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_credential_and_model_are_substituted() {
        let upstream = FakeUpstream::spawn(Behavior::Echo).await;
        let mut p = provider("silicon", &upstream.url(), Credential::Bearer("sk-real".into()));
        p.target_model = Some("deepseek-ai/DeepSeek-V3".to_string());
        let graph = start(snapshot(RoutingStrategy::Failover, vec![p])).await;

        let response = http()
            .post(format!("http://{}/v1/messages?beta=true", graph.api_addr()))
            .header("authorization", "Bearer dummy-token")
            .header("anthropic-version", "2023-06-01")
            .body(MESSAGES_BODY)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let seen = upstream.last_request().unwrap();
        assert_eq!(seen.method, "POST");
        assert_eq!(seen.path_and_query, "/v1/messages?beta=true");
        assert_eq!(seen.headers["authorization"], "Bearer sk-real");
        assert_eq!(seen.headers["anthropic-version"], "2023-06-01");
        assert_eq!(
            std::str::from_utf8(&seen.body).unwrap(),
            MESSAGES_BODY.replace("claude-3-5-sonnet", "deepseek-ai/DeepSeek-V3")
        );

        graph.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_api_key_provider_uses_x_api_key() {
        let upstream = FakeUpstream::spawn(Behavior::Echo).await;
        let graph = start(snapshot(
            RoutingStrategy::Failover,
            vec![provider("keyed", &upstream.url(), Credential::ApiKey("sk-key".into()))],
        ))
        .await;

        http()
            .get(format!("http://{}/v1/models", graph.api_addr()))
            .header("authorization", "Bearer dummy-token")
            .send()
            .await
            .unwrap();

        let seen = upstream.last_request().unwrap();
        assert_eq!(seen.headers["x-api-key"], "sk-key");
        assert!(seen.headers.get("authorization").is_none());

        graph.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failover_after_repeated_server_errors() {
        let broken = FakeUpstream::spawn(Behavior::Status(500)).await;
        let healthy = FakeUpstream::spawn(Behavior::Echo).await;
        let graph = start(snapshot(
            RoutingStrategy::Failover,
            vec![
                provider("broken", &broken.url(), Credential::Bearer("sk-a".into())),
                provider("healthy", &healthy.url(), Credential::Bearer("sk-b".into())),
            ],
        ))
        .await;
        let url = format!("http://{}/v1/messages", graph.api_addr());

        for _ in 0..5 {
            let response = http().post(&url).body(MESSAGES_BODY).send().await.unwrap();
            // Server errors are relayed verbatim.
            assert_eq!(response.status(), 500);
            let json: Value = response.json().await.unwrap();
            assert_eq!(json["error"]["message"], "upstream broke");
        }

        let response = http().post(&url).body(MESSAGES_BODY).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(broken.hits(), 5);
        assert_eq!(healthy.hits(), 1);

        let providers: Value = http()
            .get(format!("http://{}/ccenv/providers", graph.api_addr()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(providers["strategy"], "failover");
        assert_eq!(providers["providers"][0]["disabled"], true);
        assert_eq!(providers["providers"][1]["disabled"], false);

        graph.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_robin_alternates() {
        let a = FakeUpstream::spawn(Behavior::Echo).await;
        let b = FakeUpstream::spawn(Behavior::Echo).await;
        let graph = start(snapshot(
            RoutingStrategy::RoundRobin,
            vec![
                provider("a", &a.url(), Credential::Bearer("sk-a".into())),
                provider("b", &b.url(), Credential::Bearer("sk-b".into())),
            ],
        ))
        .await;

        for _ in 0..4 {
            http()
                .post(format!("http://{}/v1/messages", graph.api_addr()))
                .body(MESSAGES_BODY)
                .send()
                .await
                .unwrap();
        }
        assert_eq!(a.hits(), 2);
        assert_eq!(b.hits(), 2);

        graph.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transport_failure_is_bad_gateway() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_url = format!("http://{}", closed.local_addr().unwrap());
        drop(closed);

        let graph = start(snapshot(
            RoutingStrategy::Failover,
            vec![provider("dead", &dead_url, Credential::Bearer("sk".into()))],
        ))
        .await;

        let response = http()
            .post(format!("http://{}/v1/messages", graph.api_addr()))
            .body(MESSAGES_BODY)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 502);
        let json: Value = response.json().await.unwrap();
        assert_eq!(json["error"]["type"], "api_error");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("CCENV ")
        );

        graph.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streamed_response_arrives_intact() {
        let chunks = vec![
            "event: message_start\ndata: {\"type\":\"message_start\"}\n\n",
            "event: content_block_delta\ndata: {\"delta\":\"Hel",
            "lo\"}\n\n",
            "event: message_stop\ndata: {}\n\n",
        ];
        let expected: String = chunks.concat();
        let upstream =
            FakeUpstream::spawn(Behavior::Stream(chunks, Duration::from_millis(20))).await;
        let graph = start(snapshot(
            RoutingStrategy::Failover,
            vec![provider("sse", &upstream.url(), Credential::Bearer("sk".into()))],
        ))
        .await;

        let response = http()
            .post(format!("http://{}/v1/messages", graph.api_addr()))
            .body(MESSAGES_BODY)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let mut received = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(String::from_utf8(received).unwrap(), expected);

        graph.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wrong_method_and_unknown_path() {
        let graph = start(snapshot(RoutingStrategy::Failover, Vec::new())).await;

        let response = http()
            .get(format!("http://{}/v1/messages", graph.api_addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 405);

        let response = http()
            .get(format!("http://{}/nope", graph.api_addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        let json: Value = response.json().await.unwrap();
        assert_eq!(json["error"]["type"], "invalid_request_error");

        graph.shutdown().await.unwrap();
    }
}
