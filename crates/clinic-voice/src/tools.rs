//! Tool-call dispatch.
//!
//! The agent can ask the host to act (open the booking calendar) while the
//! call stays up. Only the first recognized invocation in a message is
//! handled; the rest of that message is ignored. Unknown tool names are
//! skipped silently so newer agents keep working against older clients.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{OutboundMessage, ToolInvocation, ToolResult};
use crate::session::HostCallbacks;
use crate::uplink::Uplink;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};

/// Tool the agent calls to show the booking view.
pub const OPEN_BOOKING_CALENDAR: &str = "openBookingCalendar";

/// When the response to an invocation is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// Reply success before running the handler; handler failures are only logged.
    AcknowledgeFirst,
    /// Run the handler and reply with its success or failure payload.
    AfterInvoke,
}

/// Host-side implementation of a tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, call: &ToolInvocation) -> Result<serde_json::Value, String>;
}

/// Result of handling one tool-call message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub id: String,
    pub name: String,
    /// The response that went back to the agent.
    pub reply: ToolResult,
    /// Error from the handler, if it failed after the reply was sent.
    pub handler_error: Option<String>,
    /// Collapse the widget UI (the audio session is untouched).
    pub minimize_ui: bool,
}

struct Registration {
    policy: ReplyPolicy,
    minimize_ui: bool,
    handler: Arc<dyn ToolHandler>,
}

/// Routes agent tool invocations to host handlers.
#[derive(Default)]
pub struct ToolDispatcher {
    tools: HashMap<String, Registration>,
}

/// Adapter from [`HostCallbacks::on_open_booking`] to a tool handler.
struct BookingHandler {
    host: Arc<dyn HostCallbacks>,
}

#[async_trait]
impl ToolHandler for BookingHandler {
    async fn invoke(&self, _call: &ToolInvocation) -> Result<serde_json::Value, String> {
        self.host.on_open_booking().await?;
        Ok(json!({ "opened": true }))
    }
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with `openBookingCalendar` wired to the host.
    pub fn with_booking(host: Arc<dyn HostCallbacks>) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(
            OPEN_BOOKING_CALENDAR,
            ReplyPolicy::AcknowledgeFirst,
            true,
            Arc::new(BookingHandler { host }),
        );
        dispatcher
    }

    /// Register (or replace) a tool.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        policy: ReplyPolicy,
        minimize_ui: bool,
        handler: Arc<dyn ToolHandler>,
    ) {
        self.tools.insert(
            name.into(),
            Registration {
                policy,
                minimize_ui,
                handler,
            },
        );
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Start handling the first recognized invocation in `calls`.
    ///
    /// Under [`ReplyPolicy::AcknowledgeFirst`] the success reply is queued
    /// before this returns. The handler itself runs in the returned
    /// [`ToolJob`], which the caller may spawn so a slow host never holds up
    /// the call. `Err` only when the reply could not be queued.
    pub async fn begin(&self, calls: &[ToolInvocation], uplink: &Uplink) -> VoiceResult<Option<ToolJob>> {
        for call in calls {
            let Some(registration) = self.tools.get(&call.name) else {
                info!(tool = %call.name, "ignoring unknown tool invocation");
                continue;
            };

            info!(tool = %call.name, id = %call.id, "🛠️ dispatching tool invocation");

            let acknowledged = match registration.policy {
                ReplyPolicy::AcknowledgeFirst => {
                    let reply = ToolResult::Success {
                        payload: json!({ "result": "ok" }),
                    };
                    send_reply(uplink, call, reply.clone()).await?;
                    Some(reply)
                }
                ReplyPolicy::AfterInvoke => None,
            };

            return Ok(Some(ToolJob {
                call: call.clone(),
                minimize_ui: registration.minimize_ui,
                handler: Arc::clone(&registration.handler),
                uplink: uplink.clone(),
                acknowledged,
            }));
        }
        Ok(None)
    }

    /// Handle the first recognized invocation in `calls` to completion.
    ///
    /// Exactly one response is queued for it.
    pub async fn dispatch(
        &self,
        calls: &[ToolInvocation],
        uplink: &Uplink,
    ) -> VoiceResult<Option<ToolOutcome>> {
        match self.begin(calls, uplink).await? {
            Some(job) => job.run().await.map(Some),
            None => Ok(None),
        }
    }
}

/// A recognized invocation whose handler has not run yet.
pub struct ToolJob {
    call: ToolInvocation,
    minimize_ui: bool,
    handler: Arc<dyn ToolHandler>,
    uplink: Uplink,
    /// Reply already queued under [`ReplyPolicy::AcknowledgeFirst`].
    acknowledged: Option<ToolResult>,
}

impl ToolJob {
    pub fn call(&self) -> &ToolInvocation {
        &self.call
    }

    /// Run the handler and, unless already acknowledged, queue its reply.
    pub async fn run(self) -> VoiceResult<ToolOutcome> {
        let result = run_handler(self.handler.as_ref(), &self.call).await;

        let (reply, handler_error) = match self.acknowledged {
            Some(reply) => (reply, result.err()),
            None => {
                let (reply, handler_error) = match result {
                    Ok(payload) => (ToolResult::Success { payload }, None),
                    Err(e) => (ToolResult::Failure { error: e.clone() }, Some(e)),
                };
                send_reply(&self.uplink, &self.call, reply.clone()).await?;
                (reply, handler_error)
            }
        };

        if let Some(ref e) = handler_error {
            warn!(tool = %self.call.name, id = %self.call.id, "tool handler failed: {}", e);
        }

        Ok(ToolOutcome {
            id: self.call.id,
            name: self.call.name,
            reply,
            handler_error,
            minimize_ui: self.minimize_ui,
        })
    }
}

async fn send_reply(uplink: &Uplink, call: &ToolInvocation, result: ToolResult) -> VoiceResult<()> {
    uplink
        .send_control(OutboundMessage::ToolResponse {
            id: call.id.clone(),
            name: call.name.clone(),
            result,
        })
        .await
}

/// Run a handler, turning a panic into an error.
async fn run_handler(handler: &dyn ToolHandler, call: &ToolInvocation) -> Result<serde_json::Value, String> {
    match AssertUnwindSafe(handler.invoke(call)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(VoiceError::ToolDispatch(format!("handler for '{}' panicked", call.name)).to_string()),
    }
}
