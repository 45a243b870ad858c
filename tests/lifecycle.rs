mod common;

#[cfg(test)]
mod test {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use http::header;
    use httpproxy::{
        BuildError, HttpProxy, ProxyController, Runtime, StageSlot, config::StageSpec,
        core::rate::TICK_INTERVAL,
    };
    use serde_json::json;

    use crate::common::{self, Recorder, request, stage};

    const CLOSE_ORDER: [&str; 9] = [
        "close:fallback",
        "close:validator",
        "close:rate_limiter",
        "close:circuit_breaker",
        "close:adaptor",
        "close:mirror_backend",
        "close:candidate_backend",
        "close:backend",
        "close:compression",
    ];

    async fn wait_for(recorder: &Recorder, event: &str) {
        for _ in 0..100 {
            if recorder.events().iter().any(|e| e == event) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("'{event}' was never recorded: {:?}", recorder.events());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_releases_every_stage_in_order() {
        let recorder = Recorder::default();
        let config = common::full_config().build().unwrap();
        let proxy =
            HttpProxy::new(&config, &Runtime::new(), &common::registry(&recorder)).unwrap();

        proxy.close();

        assert_eq!(recorder.events(), CLOSE_ORDER);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_skips_absent_stages() {
        let recorder = Recorder::default();
        let config = common::config()
            .rate_limiter(stage())
            .compression(stage())
            .build()
            .unwrap();
        let proxy =
            HttpProxy::new(&config, &Runtime::new(), &common::registry(&recorder)).unwrap();

        proxy.close();

        assert_eq!(
            recorder.events(),
            vec!["close:rate_limiter", "close:backend", "close:compression"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_failure_does_not_stop_teardown() {
        let recorder = Recorder::default();
        let refuses = stage().with_param("fail_close", json!(true));
        let config = common::full_config()
            .validator(refuses.clone())
            .backend(refuses)
            .build()
            .unwrap();
        let proxy =
            HttpProxy::new(&config, &Runtime::new(), &common::registry(&recorder)).unwrap();

        proxy.close();

        assert_eq!(recorder.events(), CLOSE_ORDER);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compression_observes_backend_response() {
        let recorder = Recorder::default();
        let config = common::config()
            .backend(stage().with_param("status", json!(201)))
            .compression(stage())
            .build()
            .unwrap();
        let proxy =
            HttpProxy::new(&config, &Runtime::new(), &common::registry(&recorder)).unwrap();

        let mut ctx = request();
        proxy.handle(&mut ctx).await;
        let response = ctx.finish();

        assert_eq!(recorder.matching("compression"), vec!["compression:backend:201"]);
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "test");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compression_observes_candidate_response() {
        let recorder = Recorder::default();
        let config = common::config()
            .candidate_backend(stage().with_param("accept", json!(true)))
            .compression(stage())
            .build()
            .unwrap();
        let proxy =
            HttpProxy::new(&config, &Runtime::new(), &common::registry(&recorder)).unwrap();

        let mut ctx = request();
        proxy.handle(&mut ctx).await;

        assert_eq!(
            recorder.matching("compression"),
            vec!["compression:candidate_backend:200"]
        );
        assert!(
            ctx.response()
                .headers()
                .contains_key(header::CONTENT_ENCODING)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_compression_without_config() {
        let recorder = Recorder::default();
        let config = common::config().build().unwrap();
        let proxy =
            HttpProxy::new(&config, &Runtime::new(), &common::registry(&recorder)).unwrap();

        let mut ctx = request();
        proxy.handle(&mut ctx).await;

        assert!(recorder.matching("compression").is_empty());
        assert!(
            !ctx.response()
                .headers()
                .contains_key(header::CONTENT_ENCODING)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_kind_fails_construction() {
        let recorder = Recorder::default();
        let config = common::config()
            .circuit_breaker(StageSpec::new("hystrix"))
            .build()
            .unwrap();

        let err = HttpProxy::new(&config, &Runtime::new(), &common::registry(&recorder))
            .err()
            .unwrap();
        match err {
            BuildError::UnknownKind { slot, kind } => {
                assert_eq!(slot, StageSlot::CircuitBreaker);
                assert_eq!(kind, "hystrix");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_params_fail_construction() {
        let recorder = Recorder::default();
        let config = common::config()
            .validator(stage().with_param("fail", json!("sometimes")))
            .build()
            .unwrap();

        let err = HttpProxy::new(&config, &Runtime::new(), &common::registry(&recorder))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BuildError::InvalidSpec {
                slot: StageSlot::Validator,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_controller_reload_swaps_and_closes_previous() {
        let recorder = Recorder::default();
        let registry = Arc::new(common::registry(&recorder));
        let first = common::config()
            .name("orders-v1")
            .backend(stage().with_param("label", json!("v1")))
            .build()
            .unwrap();
        let controller = ProxyController::new(&first, registry).unwrap();
        assert_eq!(controller.load().name(), "orders-v1");

        let second = common::config()
            .name("orders-v2")
            .backend(stage().with_param("label", json!("v2")))
            .build()
            .unwrap();
        controller.reload(&second).await.unwrap();
        assert_eq!(controller.load().name(), "orders-v2");

        wait_for(&recorder, "close:v1").await;
        assert!(!recorder.events().contains(&"close:v2".to_string()));

        controller.shutdown().await;
        assert_eq!(recorder.matching("close"), vec!["close:v1", "close:v2"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_controller_waits_for_in_flight_requests() {
        let recorder = Recorder::default();
        let registry = Arc::new(common::registry(&recorder));
        let first = common::config()
            .backend(stage().with_param("label", json!("v1")))
            .build()
            .unwrap();
        let controller = ProxyController::new(&first, registry).unwrap();

        let in_flight = controller.load();
        let second = common::config()
            .backend(stage().with_param("label", json!("v2")))
            .build()
            .unwrap();
        controller.reload(&second).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(recorder.matching("close").is_empty());

        let mut ctx = request();
        in_flight.handle(&mut ctx).await;
        assert_eq!(ctx.response().body(), "v1");
        drop(in_flight);

        wait_for(&recorder, "close:v1").await;
        controller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_controller_keeps_proxy_on_failed_reload() {
        let recorder = Recorder::default();
        let registry = Arc::new(common::registry(&recorder));
        let config = common::config().name("stable").build().unwrap();
        let controller = ProxyController::new(&config, registry).unwrap();

        let broken = common::config()
            .name("broken")
            .validator(StageSpec::new("unknown"))
            .build()
            .unwrap();
        assert!(controller.reload(&broken).await.is_err());
        assert_eq!(controller.load().name(), "stable");
        assert!(recorder.matching("close").is_empty());

        controller.shutdown().await;
        assert_eq!(recorder.events(), vec!["close:backend"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reload_keeps_request_rate() {
        let recorder = Recorder::default();
        let registry = Arc::new(common::registry(&recorder));
        let controller =
            ProxyController::new(&common::config().build().unwrap(), registry).unwrap();

        let mut ctx = request();
        controller.load().handle(&mut ctx).await;
        ctx.finish();

        controller
            .reload(&common::config().build().unwrap())
            .await
            .unwrap();

        let mut ctx = request();
        controller.load().handle(&mut ctx).await;
        ctx.finish();

        assert_eq!(controller.runtime().rate().count(), 2);
        assert_eq!(controller.load().rate().count(), 2);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_ticker_feeds_request_rate() {
        let recorder = Recorder::default();
        let registry = Arc::new(common::registry(&recorder));
        let controller =
            ProxyController::new(&common::config().build().unwrap(), registry).unwrap();

        for _ in 0..10 {
            let mut ctx = request();
            controller.load().handle(&mut ctx).await;
            ctx.finish();
        }
        let rate = controller.runtime().rate();
        assert_eq!(rate.rate(), 0.0);

        let ticker = controller.spawn_rate_ticker();
        // the paused clock auto-advances past the first tick
        tokio::time::sleep(TICK_INTERVAL + Duration::from_millis(10)).await;
        assert!((rate.rate() - 2.0).abs() < 1e-9, "rate was {}", rate.rate());

        ticker.abort();
        assert!(ticker.await.unwrap_err().is_cancelled());
        controller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_gives_up_on_held_proxy() {
        let recorder = Recorder::default();
        let registry = Arc::new(common::registry(&recorder));
        let controller = ProxyController::new(&common::config().build().unwrap(), registry)
            .unwrap()
            .with_drain_timeout(Duration::from_millis(200));

        let _held = controller.load();
        let finished = tokio::time::timeout(Duration::from_secs(5), controller.shutdown()).await;

        assert!(finished.is_ok());
        // still referenced, so never closed
        assert!(recorder.matching("close").is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reload_relabels_rate_gauge() {
        let recorder = Recorder::default();
        let registry = Arc::new(common::registry(&recorder));
        let first = common::config().name("orders-v1").build().unwrap();
        let controller = ProxyController::new(&first, registry).unwrap();
        assert_eq!(controller.rate_gauge().proxy(), "orders-v1");

        let renamed = common::config().name("orders-v2").build().unwrap();
        controller.reload(&renamed).await.unwrap();
        assert_eq!(controller.rate_gauge().proxy(), "orders-v2");

        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_ticker_runs_stage_housekeeping() {
        let recorder = Recorder::default();
        let registry = Arc::new(common::registry(&recorder));
        let controller =
            ProxyController::new(&common::config().build().unwrap(), registry).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        controller
            .runtime()
            .stage(StageSlot::RateLimiter)
            .set_housekeeping(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        let ticker = controller.spawn_rate_ticker();
        tokio::time::sleep(TICK_INTERVAL * 2 + Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        ticker.abort();
        controller.shutdown().await;
    }
}
