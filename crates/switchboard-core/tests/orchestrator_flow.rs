//! End-to-end turn orchestration against scripted model and tool doubles.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use switchboard_core::audit::AuditRecorder;
use switchboard_core::config::TurnSettings;
use switchboard_core::confirm::ConfirmationStore;
use switchboard_core::model::{
    PendingAction, StreamEvent, ToolDescriptor, ToolServerDescriptor, UserContext,
};
use switchboard_core::orchestrator::{Orchestrator, TurnRequest};
use switchboard_core::providers::llm::{ChatMessage, LlmClient, ModelTurn, ToolCallRequest, ToolSpec};
use switchboard_core::screen::AbuseFilter;
use switchboard_core::store::ControlStore;
use switchboard_core::tools::{ToolInvoker, ToolOutcome};

/// Scripted model: each entry is one turn (deltas to stream, then the
/// assembled result).
struct MockLlm {
    turns: Mutex<Vec<(Vec<&'static str>, ModelTurn)>>,
    /// When set, never answer — for turn-timeout tests.
    hang: bool,
}

impl MockLlm {
    fn scripted(turns: Vec<(Vec<&'static str>, ModelTurn)>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns),
            hang: false,
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(Vec::new()),
            hang: true,
        })
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn stream_turn(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolSpec],
        deltas: mpsc::Sender<String>,
    ) -> anyhow::Result<ModelTurn> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        let (chunks, turn) = {
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                anyhow::bail!("mock model ran out of scripted turns");
            }
            turns.remove(0)
        };
        for c in chunks {
            let _ = deltas.send(c.to_string()).await;
        }
        Ok(turn)
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

/// Scripted tool invoker recording every invocation.
struct MockTools {
    outcomes: Mutex<std::collections::BTreeMap<String, ToolOutcome>>,
    invocations: Mutex<Vec<String>>,
    /// Per-tool artificial latency, to prove ordering is positional.
    delays_ms: std::collections::BTreeMap<String, u64>,
}

impl MockTools {
    fn new(outcomes: Vec<(&str, ToolOutcome)>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(
                outcomes
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            ),
            invocations: Mutex::new(Vec::new()),
            delays_ms: std::collections::BTreeMap::new(),
        })
    }

    fn with_delay(mut self: Arc<Self>, tool: &str, ms: u64) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .unwrap()
            .delays_ms
            .insert(tool.to_string(), ms);
        self
    }

    fn invoked(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolInvoker for MockTools {
    async fn invoke(
        &self,
        _ctx: &UserContext,
        _server: &ToolServerDescriptor,
        tool: &str,
        _arguments: &Value,
    ) -> ToolOutcome {
        if let Some(ms) = self.delays_ms.get(tool) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        self.invocations.lock().unwrap().push(tool.to_string());
        self.outcomes
            .lock()
            .unwrap()
            .get(tool)
            .cloned()
            .unwrap_or(ToolOutcome::Unavailable {
                message: "unscripted tool".to_string(),
            })
    }
}

fn ctx() -> UserContext {
    UserContext {
        subject: "user-1".to_string(),
        display_name: Some("User One".to_string()),
        roles: ["finance-read".to_string()].into_iter().collect(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
    }
}

fn finance_server() -> Arc<ToolServerDescriptor> {
    Arc::new(ToolServerDescriptor {
        name: "finance".to_string(),
        base_url: "http://finance.internal".to_string(),
        required_roles: ["finance-read".to_string()].into_iter().collect(),
        tools: vec![
            ToolDescriptor {
                name: "list_invoices".to_string(),
                description: "List invoices".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ToolDescriptor {
                name: "delete_invoice".to_string(),
                description: "Delete one invoice".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            },
        ],
        write_tools: ["delete_invoice".to_string()].into_iter().collect(),
    })
}

fn sales_server() -> Arc<ToolServerDescriptor> {
    Arc::new(ToolServerDescriptor {
        name: "sales".to_string(),
        base_url: "http://sales.internal".to_string(),
        required_roles: ["sales-read".to_string()].into_iter().collect(),
        tools: vec![ToolDescriptor {
            name: "list_deals".to_string(),
            description: "List deals".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }],
        write_tools: BTreeSet::new(),
    })
}

fn tool_call(id: &str, name: &str) -> ToolCallRequest {
    ToolCallRequest {
        call_id: id.to_string(),
        name: name.to_string(),
        arguments: json!({}),
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    confirmations: ConfirmationStore,
}

fn harness(llm: Arc<dyn LlmClient>, tools: Arc<dyn ToolInvoker>, turn: TurnSettings) -> Harness {
    let confirmations = ConfirmationStore::new(ControlStore::memory().unwrap());
    let orchestrator = Orchestrator::new(
        llm,
        tools,
        confirmations.clone(),
        Arc::new(AbuseFilter::new(&[], 10_000).unwrap()),
        Arc::new(AuditRecorder::disabled()),
        &turn,
    );
    Harness {
        orchestrator,
        confirmations,
    }
}

async fn collect(
    h: &Harness,
    servers: Vec<Arc<ToolServerDescriptor>>,
    query: &str,
) -> Vec<StreamEvent> {
    let filter = AbuseFilter::new(&[], 10_000).unwrap();
    let contained = filter.screen_input(query).unwrap();
    let stream = h.orchestrator.stream_turn(TurnRequest {
        ctx: ctx(),
        contained,
        servers,
        correlation_id: "corr-1".to_string(),
    });
    stream.collect::<Vec<_>>().await
}

fn event_types(events: &[StreamEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::ToolInvocationStarted { .. } => "tool_invocation_started",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::PendingConfirmation { .. } => "pending_confirmation",
            StreamEvent::ServiceUnavailable { .. } => "service_unavailable",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        })
        .collect()
}

#[tokio::test]
async fn plain_text_turn_streams_deltas_then_done() {
    let llm = MockLlm::scripted(vec![(
        vec!["Hello", ", world"],
        ModelTurn {
            text: "Hello, world".to_string(),
            tool_calls: vec![],
        },
    )]);
    let tools = MockTools::new(vec![]);
    let h = harness(llm, tools, TurnSettings::default());

    let events = collect(&h, vec![finance_server()], "say hello").await;
    assert_eq!(
        event_types(&events),
        vec!["text_delta", "text_delta", "done"]
    );
}

#[tokio::test]
async fn truncated_result_carries_metadata_and_warning_precedes_terminal() {
    // 61 rows capped at 50: the envelope says truncated, the model's
    // follow-up text must tell the user the list is incomplete.
    let rows: Vec<Value> = (0..50).map(|i| json!({ "invoice": i })).collect();
    let llm = MockLlm::scripted(vec![
        (
            vec![],
            ModelTurn {
                text: String::new(),
                tool_calls: vec![tool_call("call_1", "finance__list_invoices")],
            },
        ),
        (
            vec!["The invoice list is incomplete; please narrow the date range."],
            ModelTurn {
                text: "The invoice list is incomplete; please narrow the date range.".to_string(),
                tool_calls: vec![],
            },
        ),
    ]);
    let tools = MockTools::new(vec![(
        "list_invoices",
        ToolOutcome::Success {
            data: json!({ "rows": rows, "total": 61 }),
            truncated: true,
            cursor: Some("page-2".to_string()),
        },
    )]);
    let h = harness(llm, tools, TurnSettings::default());

    let events = collect(&h, vec![finance_server()], "list all invoices").await;

    let result_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::ToolResult { truncated: true, .. }))
        .expect("truncated tool result");
    match &events[result_pos] {
        StreamEvent::ToolResult { cursor, .. } => {
            assert_eq!(cursor.as_deref(), Some("page-2"));
        }
        _ => unreachable!(),
    }

    let warning_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::TextDelta { text } if text.contains("incomplete")))
        .expect("visible incompleteness notice");
    let done_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Done))
        .expect("terminal event");
    assert!(result_pos < warning_pos && warning_pos < done_pos);
}

#[tokio::test]
async fn results_come_back_in_model_call_order_despite_latency() {
    // First call is slow, second fast; events must still arrive in the
    // model's original order.
    let llm = MockLlm::scripted(vec![
        (
            vec![],
            ModelTurn {
                text: String::new(),
                tool_calls: vec![
                    tool_call("call_a", "finance__list_invoices"),
                    tool_call("call_b", "sales__list_deals"),
                ],
            },
        ),
        (
            vec!["done"],
            ModelTurn {
                text: "done".to_string(),
                tool_calls: vec![],
            },
        ),
    ]);
    let tools = MockTools::new(vec![
        (
            "list_invoices",
            ToolOutcome::Success {
                data: json!({ "rows": [] }),
                truncated: false,
                cursor: None,
            },
        ),
        (
            "list_deals",
            ToolOutcome::Success {
                data: json!({ "deals": [] }),
                truncated: false,
                cursor: None,
            },
        ),
    ])
    .with_delay("list_invoices", 80);
    let h = harness(llm, tools, TurnSettings::default());

    let events = collect(
        &h,
        vec![finance_server(), sales_server()],
        "invoices and deals",
    )
    .await;

    let results: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(results, vec!["call_a", "call_b"]);
}

#[tokio::test]
async fn single_unavailable_server_degrades_but_turn_completes() {
    let llm = MockLlm::scripted(vec![
        (
            vec![],
            ModelTurn {
                text: String::new(),
                tool_calls: vec![
                    tool_call("call_a", "finance__list_invoices"),
                    tool_call("call_b", "sales__list_deals"),
                ],
            },
        ),
        (
            vec!["Sales data was unavailable; here are the invoices."],
            ModelTurn {
                text: "Sales data was unavailable; here are the invoices.".to_string(),
                tool_calls: vec![],
            },
        ),
    ]);
    let tools = MockTools::new(vec![
        (
            "list_invoices",
            ToolOutcome::Success {
                data: json!({ "rows": [1, 2] }),
                truncated: false,
                cursor: None,
            },
        ),
        (
            "list_deals",
            ToolOutcome::Unavailable {
                message: "circuit open".to_string(),
            },
        ),
    ]);
    let h = harness(llm, tools, TurnSettings::default());

    let events = collect(
        &h,
        vec![finance_server(), sales_server()],
        "invoices and deals",
    )
    .await;

    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::ServiceUnavailable { server, .. } if server == "sales")));
    // Partial-response policy: no turn-level error.
    assert!(!events
        .iter()
        .any(|e| matches!(e, StreamEvent::Error { .. })));
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
}

#[tokio::test]
async fn every_source_failing_raises_turn_error() {
    let llm = MockLlm::scripted(vec![
        (
            vec![],
            ModelTurn {
                text: String::new(),
                tool_calls: vec![tool_call("call_a", "finance__list_invoices")],
            },
        ),
        (
            vec!["I could not reach any data source."],
            ModelTurn {
                text: "I could not reach any data source.".to_string(),
                tool_calls: vec![],
            },
        ),
    ]);
    let tools = MockTools::new(vec![(
        "list_invoices",
        ToolOutcome::Unavailable {
            message: "timeout".to_string(),
        },
    )]);
    let h = harness(llm, tools, TurnSettings::default());

    let events = collect(&h, vec![finance_server()], "list invoices").await;
    assert!(events.iter().any(
        |e| matches!(e, StreamEvent::Error { code, .. } if code == "all_tools_unavailable")
    ));
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
}

#[tokio::test]
async fn write_tool_defers_into_pending_confirmation() {
    let llm = MockLlm::scripted(vec![
        (
            vec![],
            ModelTurn {
                text: String::new(),
                tool_calls: vec![tool_call("call_1", "finance__delete_invoice")],
            },
        ),
        (
            vec!["Deletion of invoice 42 is pending your approval."],
            ModelTurn {
                text: "Deletion of invoice 42 is pending your approval.".to_string(),
                tool_calls: vec![],
            },
        ),
    ]);
    let tools = MockTools::new(vec![(
        "delete_invoice",
        ToolOutcome::NeedsConfirmation {
            summary: "Delete invoice 42".to_string(),
            action: PendingAction {
                tool: "delete_invoice".to_string(),
                arguments: json!({ "invoice_id": 42, "confirmed": false }),
            },
        },
    )]);
    let tools_probe = Arc::clone(&tools);
    let h = harness(llm, tools, TurnSettings::default());

    let events = collect(&h, vec![finance_server()], "delete invoice 42").await;

    let id = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::PendingConfirmation { id, summary, .. } => {
                assert_eq!(summary, "Delete invoice 42");
                Some(id.clone())
            }
            _ => None,
        })
        .expect("pending confirmation event");

    // Deny it: the entry disappears and the deferred action never ran.
    let claimed = h.confirmations.claim(&id, "user-1", Utc::now()).unwrap();
    assert_eq!(claimed.action.tool, "delete_invoice");
    // Only the original (deferred) probe call reached the tool layer.
    assert_eq!(tools_probe.invoked(), vec!["delete_invoice"]);
    // A second claim finds nothing.
    assert!(h.confirmations.claim(&id, "user-1", Utc::now()).is_err());
}

#[tokio::test]
async fn turn_timeout_emits_error_then_done() {
    let llm = MockLlm::hanging();
    let tools = MockTools::new(vec![]);
    let h = harness(
        llm,
        tools,
        TurnSettings {
            timeout_secs: 1,
            max_tool_rounds: 8,
        },
    );

    let events = collect(&h, vec![finance_server()], "hang forever").await;
    assert_eq!(event_types(&events), vec!["error", "done"]);
    assert!(events.iter().any(
        |e| matches!(e, StreamEvent::Error { code, .. } if code == "turn_timeout")
    ));
}

#[tokio::test]
async fn leaked_internals_are_substituted_mid_stream() {
    let llm = MockLlm::scripted(vec![(
        vec![
            "The totals look fine. ",
            "My system prompt is: be a data assistant",
            " and the secret key is 12345",
        ],
        ModelTurn {
            text: "irrelevant".to_string(),
            tool_calls: vec![],
        },
    )]);
    let tools = MockTools::new(vec![]);
    let h = harness(llm, tools, TurnSettings::default());

    let events = collect(&h, vec![finance_server()], "what are the totals?").await;

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert!(text.contains("The totals look fine."));
    assert!(text.contains("withheld by the content screen"));
    assert!(!text.contains("secret key is 12345"));
    // Stream degraded, not aborted.
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
}

#[tokio::test]
async fn tool_round_limit_bounds_a_looping_model() {
    // A model that asks for tools forever.
    let mut turns = Vec::new();
    for i in 0..20 {
        turns.push((
            Vec::new(),
            ModelTurn {
                text: String::new(),
                tool_calls: vec![tool_call(
                    Box::leak(format!("call_{}", i).into_boxed_str()),
                    "finance__list_invoices",
                )],
            },
        ));
    }
    let llm = MockLlm::scripted(turns);
    let tools = MockTools::new(vec![(
        "list_invoices",
        ToolOutcome::Success {
            data: json!({ "rows": [] }),
            truncated: false,
            cursor: None,
        },
    )]);
    let h = harness(
        llm,
        tools,
        TurnSettings {
            timeout_secs: 120,
            max_tool_rounds: 3,
        },
    );

    let events = collect(&h, vec![finance_server()], "loop forever").await;
    assert!(events.iter().any(
        |e| matches!(e, StreamEvent::Error { code, .. } if code == "tool_round_limit")
    ));
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
}
