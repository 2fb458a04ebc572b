//! End-to-end scheduler scenarios, driven tick by tick against scripted
//! collaborators. No timers: each layer's per-iteration function is called
//! directly, so the ordering is deterministic.

mod support;

use serde_json::json;

use mingle_core::types::LurkMode;
use mingle_engine::intent::{self, EvalKind};
use mingle_engine::observer::{self, ObserveAction, ObserverCtl};
use mingle_engine::reply::{self, ReplyAction};
use mingle_engine::{compress, fetcher};
use mingle_gateway::SendOutcome;

use support::{block, gw_msg, harness};

fn ten_history_messages() -> Vec<mingle_gateway::GatewayMessage> {
    (1..=10)
        .map(|i| {
            let at = i == 3 || i == 7;
            gw_msg(
                &format!("m{i:02}"),
                i,
                if at { "@小明 在吗" } else { "闲聊内容" },
                at,
            )
        })
        .collect()
}

#[tokio::test]
async fn first_run_stays_silent_on_historical_mentions() {
    let h = harness(&["g1"]);
    h.gateway.push_batch(vec![block("g1", ten_history_messages())]);
    h.gateway.push_batch(vec![block("g1", ten_history_messages())]);

    fetcher::poll_once(&h.rt).await;
    let state = h.rt.target("g1").unwrap();

    // Both historical mentions were absorbed on the very first pull.
    {
        let consumed = state.consumed_at.lock().unwrap();
        assert!(consumed.contains("m03"));
        assert!(consumed.contains("m07"));
    }
    assert!(!state.intent.lock().unwrap().urgent_at_me);

    // First runs of reply and observer only place their fences.
    let mut last_reply = None;
    assert_eq!(
        reply::reply_once(&h.rt, &state, &mut last_reply).await,
        ReplyAction::Skipped
    );
    let mut ctl = ObserverCtl::default();
    assert_eq!(
        observer::observe_once(&h.rt, &state, &mut ctl).await,
        ObserveAction::Skipped
    );
    {
        let watermarks = state.watermarks.lock().unwrap();
        assert_eq!(watermarks.reply.as_deref(), Some("m10"));
        assert_eq!(watermarks.observer.as_deref(), Some("m10"));
    }

    // An identical second pull inserts nothing and still triggers nothing.
    fetcher::poll_once(&h.rt).await;
    assert_eq!(state.buffer.lock().unwrap().len(), 10);
    assert_eq!(
        reply::reply_once(&h.rt, &state, &mut last_reply).await,
        ReplyAction::Skipped
    );

    assert!(h.gateway.sends.lock().unwrap().is_empty());
    assert_eq!(h.backend.request_count(), 0);
}

#[tokio::test]
async fn urgent_mention_flows_through_intent_to_reply() {
    let h = harness(&["g1"]);
    let history: Vec<_> = (1..=3)
        .map(|i| gw_msg(&format!("m{i:02}"), i, "闲聊", false))
        .collect();
    h.gateway.push_batch(vec![block("g1", history.clone())]);

    fetcher::poll_once(&h.rt).await;
    let state = h.rt.target("g1").unwrap();
    let mut last_reply = None;
    reply::reply_once(&h.rt, &state, &mut last_reply).await;

    // A fresh @-mention arrives.
    let mut with_mention = history;
    with_mention.push(gw_msg("m04", 4, "@小明 周末出来吗", true));
    h.gateway.push_batch(vec![block("g1", with_mention)]);
    fetcher::poll_once(&h.rt).await;

    assert!(state.intent.lock().unwrap().urgent_at_me);
    assert!(state.consumed_at.lock().unwrap().contains("m04"));

    // Intent evaluates urgently and authorizes a reply.
    h.backend.push_text("[想聊：他在叫我]");
    assert_eq!(
        intent::intent_tick(&h.rt, &state).await,
        Some(EvalKind::Urgent)
    );
    assert!(state.reply_wake.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(
        state.watermarks.lock().unwrap().intent.as_deref(),
        Some("m04")
    );

    // Reply speaks through the send tool.
    h.backend
        .push_tool_call("send_message", json!({ "content": "来啦来啦" }));
    h.backend.push_text("");
    assert_eq!(
        reply::reply_once(&h.rt, &state, &mut last_reply).await,
        ReplyAction::Replied
    );
    assert_eq!(h.gateway.sent_contents(), vec!["来啦来啦"]);
    assert_eq!(
        state.watermarks.lock().unwrap().reply.as_deref(),
        Some("m04")
    );
    assert!(state.gate_locked());
    assert!(state.intent.lock().unwrap().force_eval);

    // The forced post-send evaluation releases the gate.
    h.backend.push_text("[无感：刚说过话了]");
    assert_eq!(
        intent::intent_tick(&h.rt, &state).await,
        Some(EvalKind::AfterSend)
    );
    assert!(!state.gate_locked());
    assert!(!state.reply_wake.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn gate_limits_persistent_willingness_to_one_send() {
    let h = harness(&["g1"]);
    h.gateway.push_batch(vec![block(
        "g1",
        (1..=3)
            .map(|i| gw_msg(&format!("m{i:02}"), i, "聊得火热", false))
            .collect(),
    )]);
    fetcher::poll_once(&h.rt).await;
    let state = h.rt.target("g1").unwrap();
    let mut last_reply = None;
    reply::reply_once(&h.rt, &state, &mut last_reply).await;

    // Cycle 1: willingness 4 → one send.
    h.backend.push_text("[想聊：这个话题我也想说]");
    assert_eq!(
        intent::intent_tick(&h.rt, &state).await,
        Some(EvalKind::Normal)
    );
    h.backend
        .push_tool_call("send_message", json!({ "content": "我也觉得" }));
    h.backend.push_text("");
    assert_eq!(
        reply::reply_once(&h.rt, &state, &mut last_reply).await,
        ReplyAction::Replied
    );

    // Cycle 2: the forced evaluation still reports 4, unlocking the gate and
    // re-authorizing reply — but the current-thought rule makes the model
    // stay silent with nobody having responded.
    h.backend.push_text("[想聊：还想继续说]");
    assert_eq!(
        intent::intent_tick(&h.rt, &state).await,
        Some(EvalKind::AfterSend)
    );
    h.backend.push_text("[沉默]：刚才已经说过了");
    assert_eq!(
        reply::reply_once(&h.rt, &state, &mut last_reply).await,
        ReplyAction::Silent
    );

    // Cycle 3: nothing new and the cooldown has not elapsed — no evaluation,
    // no reply trigger.
    assert_eq!(intent::intent_tick(&h.rt, &state).await, None);
    assert_eq!(
        reply::reply_once(&h.rt, &state, &mut last_reply).await,
        ReplyAction::Skipped
    );

    assert_eq!(h.gateway.sends.lock().unwrap().len(), 1);
    assert_eq!(h.rt.bus.count_messages_containing("gate locked"), 1);
    assert_eq!(h.rt.bus.count_messages_containing("intent gate unlocked"), 1);
}

#[tokio::test]
async fn failed_sends_keep_the_watermark_until_success() {
    let h = harness(&["g1"]);
    h.gateway.push_batch(vec![block(
        "g1",
        (1..=3)
            .map(|i| gw_msg(&format!("m{i:02}"), i, "起因", false))
            .collect(),
    )]);
    fetcher::poll_once(&h.rt).await;
    let state = h.rt.target("g1").unwrap();
    let mut last_reply = None;
    reply::reply_once(&h.rt, &state, &mut last_reply).await;

    let mut more: Vec<_> = (1..=3)
        .map(|i| gw_msg(&format!("m{i:02}"), i, "起因", false))
        .collect();
    more.push(gw_msg("m04", 4, "@小明 快回话", true));
    h.gateway.push_batch(vec![block("g1", more)]);
    fetcher::poll_once(&h.rt).await;

    h.backend.push_text("[想聊：被叫到了]");
    intent::intent_tick(&h.rt, &state).await;

    // Two failures, then success.
    h.gateway.push_send_result(SendOutcome {
        success: false,
        message_id: None,
        timestamp: None,
        error: Some("gateway backpressure".into()),
    });
    h.gateway.push_send_result(SendOutcome {
        success: false,
        message_id: None,
        timestamp: None,
        error: Some("gateway backpressure".into()),
    });

    for _ in 0..2 {
        h.backend
            .push_tool_call("send_message", json!({ "content": "在的在的" }));
        h.backend.push_text("");
        assert_eq!(
            reply::reply_once(&h.rt, &state, &mut last_reply).await,
            ReplyAction::SendFailed
        );
        assert_eq!(
            state.watermarks.lock().unwrap().reply.as_deref(),
            Some("m03"),
            "failed send must not advance the fence"
        );
    }

    h.backend
        .push_tool_call("send_message", json!({ "content": "在的在的" }));
    h.backend.push_text("");
    assert_eq!(
        reply::reply_once(&h.rt, &state, &mut last_reply).await,
        ReplyAction::Replied
    );
    assert_eq!(
        state.watermarks.lock().unwrap().reply.as_deref(),
        Some("m04")
    );

    // Three attempts hit the gateway, exactly one delivery succeeded.
    assert_eq!(h.gateway.sends.lock().unwrap().len(), 3);
    assert_eq!(state.sent_cache.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn daily_compression_digests_past_days_and_keeps_today() {
    let h = harness(&["g1"]);
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();

    for (date, text) in [
        ("2026-07-27", "周一的闲聊"),
        ("2026-07-28", "周二的争论"),
        ("2026-07-29", "周三的约饭"),
    ] {
        h.docs
            .append_group_buffer("g1", &format!("{date}T12:00:00Z"), text)
            .unwrap();
    }
    h.docs
        .append_group_buffer("g1", &format!("{today}T08:00:00Z"), "今天的内容")
        .unwrap();

    h.backend.push_text("二十七日总结");
    h.backend.push_text("二十八日总结");
    h.backend.push_text("二十九日总结");

    let written = compress::run_once(&h.rt).await;
    assert_eq!(written, 3);

    assert_eq!(
        h.docs.read_daily_digest("2026-07-27").as_deref(),
        Some("二十七日总结")
    );
    assert_eq!(
        h.docs.read_daily_digest("2026-07-29").as_deref(),
        Some("二十九日总结")
    );

    let remaining = h.docs.read_group_buffer("g1");
    assert!(remaining.contains("今天的内容"));
    assert!(!remaining.contains("周一的闲聊"));
    assert!(!remaining.contains("周三的约饭"));

    let meta = mingle_docs::meta::load_compress_meta(&h.docs);
    assert!(meta.last_compress_time.is_some());
}

#[tokio::test]
async fn failed_digest_days_survive_for_retry() {
    let h = harness(&["g1"]);
    h.docs
        .append_group_buffer("g1", "2026-07-27T12:00:00Z", "会失败的一天")
        .unwrap();
    h.docs
        .append_group_buffer("g1", "2026-07-28T12:00:00Z", "会成功的一天")
        .unwrap();

    h.backend.push_error("model overloaded");
    h.backend.push_text("二十八日总结");

    let written = compress::run_once(&h.rt).await;
    assert_eq!(written, 1);

    let remaining = h.docs.read_group_buffer("g1");
    assert!(remaining.contains("会失败的一天"));
    assert!(!remaining.contains("会成功的一天"));
    assert!(h.docs.read_daily_digest("2026-07-27").is_none());

    // The next run retries only the failed day.
    h.backend.push_text("二十七日总结");
    assert_eq!(compress::run_once(&h.rt).await, 1);
    assert!(h.docs.read_daily_digest("2026-07-27").is_some());
    assert!(!h.docs.read_group_buffer("g1").contains("会失败的一天"));
}

#[tokio::test]
async fn full_lurk_target_observes_but_never_sends() {
    let h = harness(&["g1", "g2"]);
    let history = |_t: &str| {
        (1..=2)
            .map(|i| gw_msg(&format!("m{i:02}"), i, "铺垫", false))
            .collect::<Vec<_>>()
    };
    h.gateway
        .push_batch(vec![block("g1", history("g1")), block("g2", history("g2"))]);
    fetcher::poll_once(&h.rt).await;

    let g1 = h.rt.target("g1").unwrap();
    let g2 = h.rt.target("g2").unwrap();
    g1.set_lurk_mode(LurkMode::FullLurk);

    let mut lr1 = None;
    let mut lr2 = None;
    reply::reply_once(&h.rt, &g1, &mut lr1).await;
    reply::reply_once(&h.rt, &g2, &mut lr2).await;

    // Identical @-mention bursts into both rooms.
    let with_mention = |_t: &str| {
        let mut msgs = history("x");
        msgs.push(gw_msg("m03", 3, "@小明 都来聊聊", true));
        msgs
    };
    h.gateway.push_batch(vec![
        block("g1", with_mention("g1")),
        block("g2", with_mention("g2")),
    ]);
    fetcher::poll_once(&h.rt).await;

    h.backend.push_text("[想聊：被@了]");
    intent::intent_tick(&h.rt, &g1).await;
    h.backend.push_text("[想聊：被@了]");
    intent::intent_tick(&h.rt, &g2).await;

    // g1 is in full lurk: the round is skipped and the fence still moves.
    assert_eq!(
        reply::reply_once(&h.rt, &g1, &mut lr1).await,
        ReplyAction::Skipped
    );
    assert_eq!(g1.watermarks.lock().unwrap().reply.as_deref(), Some("m03"));

    // g2 proceeds normally.
    h.backend
        .push_tool_call("send_message", json!({ "content": "来了来了" }));
    h.backend.push_text("");
    assert_eq!(
        reply::reply_once(&h.rt, &g2, &mut lr2).await,
        ReplyAction::Replied
    );

    let sends = h.gateway.sends.lock().unwrap();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].target, "g2");
}

#[tokio::test]
async fn plain_text_reply_is_deduplicated_and_auto_sent() {
    let h = harness(&["g1"]);
    h.gateway.push_batch(vec![block(
        "g1",
        (1..=2)
            .map(|i| gw_msg(&format!("m{i:02}"), i, "聊天", false))
            .collect(),
    )]);
    fetcher::poll_once(&h.rt).await;
    let state = h.rt.target("g1").unwrap();
    let mut last_reply = None;
    reply::reply_once(&h.rt, &state, &mut last_reply).await;

    h.backend.push_text("[想聊：想说两句]");
    intent::intent_tick(&h.rt, &state).await;

    // The model answers in plain text instead of using the tool, repeating
    // itself; the scheduler dedups and sends on its behalf.
    h.backend.push_text("今天真热。今天真热。大家多喝水！");
    assert_eq!(
        reply::reply_once(&h.rt, &state, &mut last_reply).await,
        ReplyAction::Replied
    );
    assert_eq!(
        h.gateway.sent_contents(),
        vec!["今天真热。大家多喝水！"]
    );
}

#[tokio::test]
async fn stale_generation_discards_late_results() {
    use mingle_engine::Engine;
    use support::{config, harness_with_config};

    // A detached runtime stands in for generation 1…
    let h = harness_with_config(config(&["g1"]));
    h.gateway.push_batch(vec![block(
        "g1",
        vec![gw_msg("m01", 1, "聊", false)],
    )]);
    fetcher::poll_once(&h.rt).await;
    assert!(h.rt.live());

    // …until its cancellation fires: no layer may mutate state afterwards.
    h.rt.cancel.cancel();
    assert!(!h.rt.live());

    let state = h.rt.target("g1").unwrap();
    h.backend.push_text("[想聊：不该被用到]");
    assert_eq!(
        intent::evaluate(&h.rt, &state, EvalKind::Normal).await,
        None
    );
    assert!(state.intent.lock().unwrap().history.is_empty());

    // A full engine restarts cleanly: stop(); start() reaches a functional
    // generation with a higher token.
    let engine = Engine::new();
    let h2 = harness_with_config(config(&["g1"]));
    let rt1 = {
        let deps = mingle_engine::EngineDeps {
            gateway: h2.gateway.clone(),
            backend: h2.backend.clone(),
            bridge: std::sync::Arc::new(support::FakeBridge),
            docs: h2.docs.clone(),
            http: reqwest::Client::new(),
        };
        engine.start(config(&["g1"]), deps).unwrap()
    };
    assert!(engine.is_running());
    engine.stop();
    assert!(!rt1.live());
    assert!(!engine.is_running());

    let h3 = harness_with_config(config(&["g1"]));
    let deps = mingle_engine::EngineDeps {
        gateway: h3.gateway.clone(),
        backend: h3.backend.clone(),
        bridge: std::sync::Arc::new(support::FakeBridge),
        docs: h3.docs.clone(),
        http: reqwest::Client::new(),
    };
    let rt2 = engine.start(config(&["g1"]), deps).unwrap();
    assert!(engine.is_running());
    assert!(rt2.generation > rt1.generation);
    assert!(rt2.live());
    assert!(!rt1.live());
    engine.stop();
}
