//! End-to-end controller scenarios driven through the public handlers with a
//! scripted host, panel, and model engine.

mod support;

use support::*;

use wayfinder_agent::{
    HelperCommand, HelperMessage, InteractiveElement, KeyCommand, PanelMessage, PanelOutbound,
    Phase, Severity, ViewportInfo,
};
use wayfinder_core_types::{TabId, TabInfo};

async fn start(h: &Harness, spec: &str) {
    h.controller
        .attach_panel(h.panel.clone())
        .await
        .expect("panel attached");
    h.controller
        .handle_panel_message(PanelMessage::StartTask {
            task_specification: spec.to_string(),
        })
        .await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForContentScriptInit);
    h.controller.handle_helper_message(HelperMessage::Ready).await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForPageState);
}

fn page_state(elements: Vec<InteractiveElement>, viewport: ViewportInfo) -> HelperMessage {
    HelperMessage::PageState {
        interactive_elements: elements,
        viewport_info: viewport,
        url: "https://example.com".to_string(),
    }
}

fn counters(result: &serde_json::Value) -> (u64, u64, u64) {
    let counters = &result["counters"];
    (
        counters["ops"].as_u64().unwrap(),
        counters["noops"].as_u64().unwrap(),
        counters["failures"].as_u64().unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn happy_path_single_click() {
    let h = harness();
    h.engine.push_plan("I will click the login button.");
    h.engine.push_grounding(CLICK_A);
    h.engine.push_judgment(JUDGE_SAFE);

    start(&h, "click the login button").await;
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;

    // Committed and dispatched: one candidate announced, one action request.
    assert_eq!(h.controller.phase().await, Phase::WaitingForAction);
    assert!(h.controller.has_pending_action().await);
    let actions = h.host.action_requests();
    assert_eq!(actions.len(), 1);
    match &actions[0] {
        HelperCommand::ReqAction {
            action,
            element_index,
            ..
        } => {
            assert_eq!(format!("{action:?}"), "Click");
            assert_eq!(*element_index, Some(0));
        }
        other => panic!("unexpected command: {other:?}"),
    }
    assert!(h
        .panel
        .sent()
        .iter()
        .any(|msg| matches!(msg, PanelOutbound::ActionCandidate { .. })));

    // Completion without navigation leads to a fresh page-state request.
    h.controller
        .handle_helper_message(HelperMessage::ActionDone {
            success: true,
            result: None,
        })
        .await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForPageState);
    assert!(!h.controller.has_pending_action().await);
    assert_eq!(h.host.page_state_requests(), 2);

    // Next round terminates the task.
    h.engine.push_grounding(TERMINATE);
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;
    assert_eq!(h.controller.phase().await, Phase::Idle);
    assert!(h.controller.task_id().await.is_none());
    assert!(h.panel.task_ended());

    let result = h.panel.exported_result().expect("history export");
    assert_eq!(counters(&result), (1, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn invalid_element_letter_is_a_noop() {
    let h = harness();
    h.engine.push_grounding(
        r#"{"element": "Z", "action": "CLICK", "value": null, "explanation": "Clicking"}"#,
    );
    h.engine.push_grounding(TERMINATE);

    start(&h, "click something").await;
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;

    // No action was dispatched; the invalid choice was reprompted within the
    // same page state and the second attempt terminated.
    assert!(h.host.action_requests().is_empty());
    let notifications = h.panel.notifications();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].contains("invalid element"), "{notifications:?}");

    let result = h.panel.exported_result().expect("history export");
    assert_eq!(counters(&result), (0, 1, 0));
}

#[tokio::test(start_paused = true)]
async fn nonsensical_scroll_is_a_noop() {
    let h = harness();
    h.engine.push_grounding(
        r#"{"element": null, "action": "SCROLL_UP", "value": null, "explanation": "Scrolling up"}"#,
    );
    h.engine.push_grounding(TERMINATE);

    start(&h, "find the footer").await;
    // scrollY = 0: scrolling up cannot move the page.
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;

    assert!(h.host.action_requests().is_empty());
    let notifications = h.panel.notifications();
    assert!(
        notifications.iter().any(|n| n.contains("scroll")),
        "{notifications:?}"
    );
    let result = h.panel.exported_result().expect("history export");
    assert_eq!(counters(&result), (0, 1, 0));
}

#[tokio::test(start_paused = true)]
async fn loading_page_waits_without_counting_a_noop() {
    let h = harness();
    h.engine.push_grounding(
        r#"{"element": null, "action": "NONE", "value": null, "explanation": "page is still loading, please wait until it has finished"}"#,
    );

    start(&h, "read the article").await;
    h.controller
        .handle_helper_message(page_state(vec![], flat_viewport()))
        .await;

    // Back to waiting for page state after the pause; no noop recorded.
    assert_eq!(h.controller.phase().await, Phase::WaitingForPageState);
    assert_eq!(h.host.page_state_requests(), 2);
    assert!(h.panel.notifications().is_empty());

    h.engine.push_grounding(TERMINATE);
    h.controller
        .handle_helper_message(page_state(vec![], flat_viewport()))
        .await;
    let result = h.panel.exported_result().expect("history export");
    assert_eq!(counters(&result), (0, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn helper_disconnect_during_anticipated_navigation() {
    let h = harness();
    h.engine.push_grounding(CLICK_A);
    h.engine.push_judgment(JUDGE_SAFE);

    start(&h, "open the dashboard").await;
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForAction);

    // The click navigated: the helper vanishes and the active tab changes.
    h.host.set_active_tab(
        TabInfo::new(TabId(2))
            .with_title("Dashboard")
            .with_url("https://example.com/dashboard"),
    );
    h.controller.handle_helper_disconnect().await;

    assert_eq!(h.controller.phase().await, Phase::WaitingForContentScriptInit);
    assert!(!h.controller.has_pending_action().await);
    assert_eq!(h.host.injections(), 2);

    // Finish the task on the new page; the navigated click counts as a
    // success and its description names the new tab.
    h.engine.push_grounding(TERMINATE);
    h.controller.handle_helper_message(HelperMessage::Ready).await;
    h.controller
        .handle_helper_message(page_state(vec![], flat_viewport()))
        .await;
    let result = h.panel.exported_result().expect("history export");
    assert_eq!(counters(&result), (1, 0, 0));
    let first_action = &result["actions"][0];
    assert_eq!(first_action["success"], true);
    assert!(first_action["description"]
        .as_str()
        .unwrap()
        .contains("navigated to 'Dashboard'"));
}

#[tokio::test(start_paused = true)]
async fn unanticipated_tab_switch_terminates() {
    let h = harness();
    h.engine.push_grounding(
        r#"{"element": "A", "action": "TYPE", "value": "hello", "explanation": "Typing"}"#,
    );

    start(&h, "type a greeting").await;
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForAction);

    // TYPE cannot navigate, yet the active tab changed.
    h.host
        .set_active_tab(TabInfo::new(TabId(9)).with_title("Elsewhere"));
    h.controller
        .handle_helper_message(HelperMessage::ActionDone {
            success: true,
            result: None,
        })
        .await;

    assert_eq!(h.controller.phase().await, Phase::Idle);
    assert!(h.panel.task_ended());
    assert!(h
        .panel
        .sent()
        .iter()
        .any(|msg| matches!(msg, PanelOutbound::Error { msg } if msg.contains("tab switched"))));
}

#[tokio::test(start_paused = true)]
async fn auto_monitor_escalation_and_rejection() {
    let mut config = test_config();
    config.auto_monitor_threshold = Severity::High;
    let h = harness_with_config(config);
    h.engine.push_grounding(CLICK_A);
    h.engine
        .push_judgment(r#"{"severity": "HIGH", "explanation": "deletes account"}"#);

    start(&h, "delete my account").await;
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;

    // Escalated instead of dispatched.
    assert!(h.host.action_requests().is_empty());
    assert_eq!(h.controller.phase().await, Phase::WaitingForMonitorResponse);
    assert!(h.controller.has_pending_action().await);
    assert!(h.panel.sent().iter().any(|msg| matches!(
        msg,
        PanelOutbound::AutoMonitorEscalation { severity, explanation }
            if *severity == Severity::High && explanation.contains("deletes account")
    )));

    // The human rejects with feedback.
    h.controller
        .handle_panel_message(PanelMessage::MonitorRejected {
            feedback: Some("wrong button".to_string()),
        })
        .await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForPageState);
    assert!(!h.controller.has_pending_action().await);
    assert!(h.host.helper_commands().iter().any(|cmd| matches!(
        cmd,
        HelperCommand::ReqPageState {
            is_monitor_retry: Some(true)
        }
    )));

    // The next round's query carries the rejection warning and feedback.
    h.engine.push_grounding(TERMINATE);
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;
    let queries = h.engine.seen_queries();
    let last_decision_query = queries
        .iter()
        .rev()
        .find(|q| q.contains("## Task"))
        .expect("decision query");
    assert!(last_decision_query.contains("rejected by the human monitor"));
    assert!(last_decision_query.contains("wrong button"));
}

#[tokio::test(start_paused = true)]
async fn keyboard_approval_dispatches_escalated_action() {
    let mut config = test_config();
    config.auto_monitor_threshold = Severity::Low;
    let h = harness_with_config(config);
    h.engine.push_grounding(CLICK_A);
    h.engine
        .push_judgment(r#"{"severity": "MEDIUM", "explanation": "submits a form"}"#);

    start(&h, "submit the form").await;
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForMonitorResponse);

    h.controller
        .handle_key_command(KeyCommand::ApprovePending)
        .await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForAction);
    assert_eq!(h.host.action_requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn key_commands_ignored_outside_monitor_wait() {
    let h = harness();
    h.engine.push_grounding(CLICK_A);
    h.engine.push_judgment(JUDGE_SAFE);

    start(&h, "click the login button").await;
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForAction);

    // Not in the monitor wait: the shortcut must be a no-op, not a terminal
    // error.
    h.controller
        .handle_key_command(KeyCommand::ApprovePending)
        .await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForAction);
    assert!(!h.panel.task_ended());
}

#[tokio::test(start_paused = true)]
async fn kill_task_aborts_and_exports() {
    let h = harness();
    h.engine.push_grounding(CLICK_A);
    h.engine.push_judgment(JUDGE_SAFE);

    start(&h, "click the login button").await;
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForAction);

    h.controller
        .handle_panel_message(PanelMessage::KillTask)
        .await;
    assert_eq!(h.controller.phase().await, Phase::Idle);
    assert!(h.controller.task_id().await.is_none());
    assert!(!h.controller.has_pending_action().await);

    let result = h.panel.exported_result().expect("history export");
    assert!(result["terminationReason"]
        .as_str()
        .unwrap()
        .contains("aborted by user"));
}

#[tokio::test(start_paused = true)]
async fn disconnected_send_enters_pending_reconnect() {
    let h = harness();
    h.engine.push_grounding(
        r#"{"element": null, "action": "SCROLL_DOWN", "value": null, "explanation": "Scrolling"}"#,
    );

    start(&h, "scroll the page").await;
    // Scrollable page so the scroll commits, but the helper port is already
    // dead when the action is dispatched.
    h.host.break_helper();
    h.controller
        .handle_helper_message(page_state(
            vec![login_button()],
            ViewportInfo {
                width: 1024,
                height: 768,
                scroll_x: 0,
                scroll_y: 0,
                page_scroll_height: 4000,
            },
        ))
        .await;

    assert_eq!(h.controller.phase().await, Phase::PendingReconnect);
    assert!(!h.controller.has_pending_action().await);

    // The disconnect event completes the handshake with a re-injection.
    h.host.repair_helper();
    h.controller.handle_helper_disconnect().await;
    assert_eq!(h.controller.phase().await, Phase::WaitingForContentScriptInit);
    assert_eq!(h.host.injections(), 2);
}

#[tokio::test(start_paused = true)]
async fn noop_streak_limit_aborts_the_task() {
    let mut config = test_config();
    config.limits.max_noops = 2;
    config.limits.max_failure_or_noop_streak = 2;
    let h = harness_with_config(config);
    for _ in 0..3 {
        h.engine.push_grounding(
            r#"{"element": null, "action": "NONE", "value": null, "explanation": "stuck"}"#,
        );
    }

    start(&h, "do something impossible").await;
    h.controller
        .handle_helper_message(page_state(vec![login_button()], flat_viewport()))
        .await;

    assert_eq!(h.controller.phase().await, Phase::Idle);
    let result = h.panel.exported_result().expect("history export");
    assert!(result["terminationReason"]
        .as_str()
        .unwrap()
        .contains("consecutive failures or noops"));
}

#[tokio::test(start_paused = true)]
async fn start_task_requires_eula() {
    let mut config = test_config();
    config.eula_accepted = false;
    let h = harness_with_config(config);

    h.controller
        .attach_panel(h.panel.clone())
        .await
        .expect("panel attached");
    h.controller
        .handle_panel_message(PanelMessage::StartTask {
            task_specification: "anything".to_string(),
        })
        .await;

    assert_eq!(h.controller.phase().await, Phase::Idle);
    assert!(h.controller.task_id().await.is_none());
    assert!(h.panel.sent().iter().any(|msg| matches!(
        msg,
        PanelOutbound::TaskStarted { success: false, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn second_start_rejected_while_running() {
    let h = harness();
    start(&h, "first task").await;

    h.controller
        .handle_panel_message(PanelMessage::StartTask {
            task_specification: "second task".to_string(),
        })
        .await;

    // Still the first task, in its original phase.
    assert_eq!(h.controller.phase().await, Phase::WaitingForPageState);
    assert!(h.panel.sent().iter().any(|msg| matches!(
        msg,
        PanelOutbound::Error { msg } if msg.contains("already running")
    )));
}

#[tokio::test(start_paused = true)]
async fn live_panel_not_replaced_mid_task() {
    let h = harness();
    let first_id = h
        .controller
        .attach_panel(h.panel.clone())
        .await
        .expect("first attach");
    h.controller
        .handle_panel_message(PanelMessage::StartTask {
            task_specification: "click the login button".to_string(),
        })
        .await;
    assert_ne!(h.controller.phase().await, Phase::Idle);

    // A newcomer may not displace the live panel while the task runs.
    let second = RecordingPanel::new();
    assert!(h.controller.attach_panel(second.clone()).await.is_none());
    assert!(second.sent().is_empty());

    // A detach carrying a wrong id must not release the live panel either.
    h.controller.detach_panel(first_id + 1).await;
    h.controller
        .handle_panel_message(PanelMessage::KillTask)
        .await;
    assert!(h.panel.task_ended());

    // Idle again: the slot is free for the newcomer.
    assert!(h.controller.attach_panel(second).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn stale_detach_does_not_clobber_replacement_panel() {
    let h = harness();
    let first_id = h
        .controller
        .attach_panel(h.panel.clone())
        .await
        .expect("first attach");

    // While idle a replacement takes the slot; the first connection's
    // cleanup then runs late (reconnect race) and must be a no-op.
    let second = RecordingPanel::new();
    h.controller
        .attach_panel(second.clone())
        .await
        .expect("second attach");
    h.controller.detach_panel(first_id).await;

    h.controller
        .handle_panel_message(PanelMessage::StartTask {
            task_specification: "click the login button".to_string(),
        })
        .await;
    assert!(second.sent().iter().any(|msg| matches!(
        msg,
        PanelOutbound::TaskStarted { success: true, .. }
    )));
    assert!(!h.panel.sent().iter().any(|msg| matches!(
        msg,
        PanelOutbound::TaskStarted { .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn task_id_defined_iff_not_idle() {
    let h = harness();
    assert_eq!(h.controller.phase().await, Phase::Idle);
    assert!(h.controller.task_id().await.is_none());

    start(&h, "click the login button").await;
    assert_ne!(h.controller.phase().await, Phase::Idle);
    assert!(h.controller.task_id().await.is_some());

    h.controller
        .handle_panel_message(PanelMessage::KillTask)
        .await;
    assert_eq!(h.controller.phase().await, Phase::Idle);
    assert!(h.controller.task_id().await.is_none());
}
