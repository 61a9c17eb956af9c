// src/logging.rs

use crate::communication::{GeneralUpdate, LogMessage, Update};
use chrono::Utc;
use crossbeam_channel::Sender;
use std::fmt::{self, Write};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Forwards every tracing event to the panel's log view.
pub struct PanelLogLayer {
    log_tx: Sender<Update>,
}

impl PanelLogLayer {
    pub fn new(log_tx: Sender<Update>) -> Self {
        Self { log_tx }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S> Layer<S> for PanelLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if visitor.message.is_empty() && visitor.fields.is_empty() {
            return;
        }
        visitor.message.push_str(&visitor.fields);

        let log_message = LogMessage {
            level: *event.metadata().level(),
            message: visitor.message,
            timestamp: Utc::now(),
            target: event.metadata().target().to_string(),
        };

        // 前端关闭后发送失败是正常的
        let _ = self
            .log_tx
            .send(Update::General(GeneralUpdate::NewLog(log_message)));
    }
}
