use crate::model::{
    Button, ButtonsMessage, Jid, ListMessage, ListRow, ListSection, MessageKey,
    OutboundInteractiveMessage, SendResult, TemplateAction, TemplateButton,
    TemplateButtonsMessage,
};
use crate::history::MessageHistory;
use crate::protocol::{ProtocolClient, SendError};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessStep {
    Buttons,
    List,
    TemplateButtons,
}

impl HarnessStep {
    pub const ALL: [HarnessStep; 3] = [Self::Buttons, Self::List, Self::TemplateButtons];

    pub fn number(self) -> u8 {
        match self {
            Self::Buttons => 1,
            Self::List => 2,
            Self::TemplateButtons => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Buttons => "buttons",
            Self::List => "list",
            Self::TemplateButtons => "template_buttons",
        }
    }
}

impl fmt::Display for HarnessStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HarnessError {
    #[error("step {step} failed: {cause}")]
    SendFailed { step: HarnessStep, cause: SendError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success { message_key: MessageKey },
    Failure { error: HarnessError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: HarnessStep,
    pub outcome: StepOutcome,
}

/// Per-step results in send order; ends at the first failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarnessReport {
    pub steps: Vec<StepRecord>,
}

impl HarnessReport {
    pub fn is_complete(&self) -> bool {
        self.steps.len() == HarnessStep::ALL.len()
            && self
                .steps
                .iter()
                .all(|s| matches!(s.outcome, StepOutcome::Success { .. }))
    }

    pub fn failure(&self) -> Option<&HarnessError> {
        self.steps.iter().find_map(|s| match &s.outcome {
            StepOutcome::Failure { error } => Some(error),
            StepOutcome::Success { .. } => None,
        })
    }

    pub fn message_keys(&self) -> Vec<&MessageKey> {
        self.steps
            .iter()
            .filter_map(|s| match &s.outcome {
                StepOutcome::Success { message_key } => Some(message_key),
                StepOutcome::Failure { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundInteractiveMessage) -> Result<SendResult, SendError>;
}

/// Sends through a live client to one fixed destination.
pub struct DestinationSender {
    client: Arc<dyn ProtocolClient>,
    jid: Jid,
    history: Option<Arc<MessageHistory>>,
}

impl DestinationSender {
    pub fn new(client: Arc<dyn ProtocolClient>, jid: Jid) -> Self {
        Self {
            client,
            jid,
            history: None,
        }
    }

    /// Records every delivered message so retransmissions can resolve it.
    pub fn with_history(mut self, history: Option<Arc<MessageHistory>>) -> Self {
        self.history = history;
        self
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }
}

#[async_trait]
impl MessageSender for DestinationSender {
    async fn send(&self, message: &OutboundInteractiveMessage) -> Result<SendResult, SendError> {
        let result = self.client.send(&self.jid, message).await?;
        if let Some(history) = &self.history {
            history.record_sent(&result.key, message);
        }
        Ok(result)
    }
}

pub struct InteractiveHarness {
    step_delay: Duration,
}

impl InteractiveHarness {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    /// Sends the three sample messages strictly one after another. A failed
    /// step is recorded and ends the run; earlier sends stay delivered.
    pub async fn run<S>(&self, sender: &S) -> HarnessReport
    where
        S: MessageSender + ?Sized,
    {
        let mut report = HarnessReport::default();
        for (i, step) in HarnessStep::ALL.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.step_delay).await;
            }
            tracing::info!(step = step.number(), kind = step.name(), "sending interactive test message");
            match sender.send(&sample_message(step)).await {
                Ok(result) => {
                    tracing::info!(step = step.number(), id = %result.key.id, "interactive test message sent");
                    report.steps.push(StepRecord {
                        step,
                        outcome: StepOutcome::Success {
                            message_key: result.key,
                        },
                    });
                }
                Err(cause) => {
                    let error = HarnessError::SendFailed { step, cause };
                    tracing::error!(error = %error, "interactive test send failed");
                    report.steps.push(StepRecord {
                        step,
                        outcome: StepOutcome::Failure { error },
                    });
                    return report;
                }
            }
        }
        tracing::info!("all interactive test messages sent, waiting for replies");
        report
    }
}

pub fn sample_message(step: HarnessStep) -> OutboundInteractiveMessage {
    match step {
        HarnessStep::Buttons => OutboundInteractiveMessage::Buttons(sample_buttons()),
        HarnessStep::List => OutboundInteractiveMessage::List(sample_list()),
        HarnessStep::TemplateButtons => {
            OutboundInteractiveMessage::TemplateButtons(sample_template_buttons())
        }
    }
}

fn sample_buttons() -> ButtonsMessage {
    let button = |id: &str, label: &str| Button {
        id: id.to_string(),
        label: label.to_string(),
    };
    ButtonsMessage {
        body_text: "🧪 *TESTE DE BOTÕES*\n\nEscolha uma opção abaixo:".to_string(),
        buttons: vec![
            button("btn_opcao1", "✅ Opção 1"),
            button("btn_opcao2", "❌ Opção 2"),
            button("btn_opcao3", "📞 Opção 3"),
        ],
        footer: "Teste InfiniteAPI - Baileys".to_string(),
    }
}

fn sample_list() -> ListMessage {
    let row = |row_id: &str, title: &str, description: &str| ListRow {
        row_id: row_id.to_string(),
        title: title.to_string(),
        description: description.to_string(),
    };
    ListMessage {
        body_text: "📋 *TESTE DE LISTA*\n\nSelecione um item:".to_string(),
        title: "Catálogo de Teste".to_string(),
        action_label: "📂 Ver Opções".to_string(),
        sections: vec![
            ListSection {
                title: "🍔 Categoria 1 - Comidas".to_string(),
                rows: vec![
                    row("pizza", "🍕 Pizza", "Pizza de queijo"),
                    row("hamburguer", "🍔 Hambúrguer", "Hambúrguer artesanal"),
                    row("sushi", "🍣 Sushi", "Combo 20 peças"),
                ],
            },
            ListSection {
                title: "🥤 Categoria 2 - Bebidas".to_string(),
                rows: vec![
                    row("refrigerante", "🥤 Refrigerante", "Coca, Pepsi, Guaraná"),
                    row("suco", "🧃 Suco Natural", "Laranja, Limão, Abacaxi"),
                ],
            },
        ],
        footer: "Teste InfiniteAPI".to_string(),
    }
}

fn sample_template_buttons() -> TemplateButtonsMessage {
    TemplateButtonsMessage {
        body_text: "🔗 *TESTE DE TEMPLATE BUTTONS*\n\nAções disponíveis:".to_string(),
        buttons: vec![
            TemplateButton {
                index: 1,
                action: TemplateAction::QuickReply {
                    display_text: "💬 Resposta Rápida".to_string(),
                    id: "quick_reply_test".to_string(),
                },
            },
            TemplateButton {
                index: 2,
                action: TemplateAction::Url {
                    display_text: "🌐 Visitar Site".to_string(),
                    url: "https://github.com/WhiskeySockets/Baileys".to_string(),
                },
            },
            TemplateButton {
                index: 3,
                action: TemplateAction::Call {
                    display_text: "📞 Ligar".to_string(),
                    phone_number: "+5515981907008".to_string(),
                },
            },
        ],
        footer: "Teste InfiniteAPI - Template Buttons".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MessageResolver;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct ScriptedSender {
        fail_on_call: Option<usize>,
        calls: Mutex<Vec<(Instant, OutboundInteractiveMessage)>>,
    }

    #[async_trait]
    impl MessageSender for ScriptedSender {
        async fn send(
            &self,
            message: &OutboundInteractiveMessage,
        ) -> Result<SendResult, SendError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((Instant::now(), message.clone()));
                calls.len()
            };
            if self.fail_on_call == Some(call) {
                return Err(SendError::Rejected("recipient unavailable".into()));
            }
            Ok(SendResult {
                key: MessageKey {
                    remote_jid: "5515991426667@s.whatsapp.net".into(),
                    id: format!("MSG{call}"),
                    from_me: true,
                },
            })
        }
    }

    #[tokio::test]
    async fn all_steps_succeed_in_order_with_pacing() {
        let delay = Duration::from_millis(40);
        let sender = ScriptedSender::default();
        let report = InteractiveHarness::new(delay).run(&sender).await;

        assert!(report.is_complete());
        let ids: Vec<_> = report.message_keys().iter().map(|k| k.id.clone()).collect();
        assert_eq!(ids, vec!["MSG1", "MSG2", "MSG3"]);
        let steps: Vec<_> = report.steps.iter().map(|s| s.step).collect();
        assert_eq!(steps, HarnessStep::ALL.to_vec());

        let calls = sender.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1].0.duration_since(pair[0].0) >= delay);
        }
        assert_eq!(calls[0].1.kind(), "buttons");
        assert_eq!(calls[1].1.kind(), "list");
        assert_eq!(calls[2].1.kind(), "template_buttons");
    }

    #[tokio::test]
    async fn failure_on_third_step_stops_the_run() {
        let sender = ScriptedSender {
            fail_on_call: Some(3),
            ..Default::default()
        };
        let report = InteractiveHarness::new(Duration::from_millis(1)).run(&sender).await;

        assert_eq!(report.steps.len(), 3);
        assert!(!report.is_complete());
        assert!(matches!(
            report.steps[2].outcome,
            StepOutcome::Failure {
                error: HarnessError::SendFailed {
                    step: HarnessStep::TemplateButtons,
                    ..
                }
            }
        ));
        assert_eq!(report.message_keys().len(), 2);
    }

    #[tokio::test]
    async fn failure_on_first_step_sends_nothing_else() {
        let sender = ScriptedSender {
            fail_on_call: Some(1),
            ..Default::default()
        };
        let report = InteractiveHarness::new(Duration::from_secs(60)).run(&sender).await;
        assert_eq!(report.steps.len(), 1);
        assert_eq!(sender.calls.lock().unwrap().len(), 1);
        assert!(report.failure().is_some());
    }

    #[test]
    fn sample_payload_shapes() {
        let OutboundInteractiveMessage::Buttons(buttons) = sample_message(HarnessStep::Buttons)
        else {
            panic!("expected buttons");
        };
        assert_eq!(buttons.buttons.len(), 3);
        assert!(!buttons.footer.is_empty());

        let OutboundInteractiveMessage::List(list) = sample_message(HarnessStep::List) else {
            panic!("expected list");
        };
        let rows: Vec<_> = list.sections.iter().map(|s| s.rows.len()).collect();
        assert_eq!(rows, vec![3, 2]);

        let OutboundInteractiveMessage::TemplateButtons(template) =
            sample_message(HarnessStep::TemplateButtons)
        else {
            panic!("expected template buttons");
        };
        let indices: Vec<_> = template.buttons.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert!(matches!(template.buttons[0].action, TemplateAction::QuickReply { .. }));
        assert!(matches!(template.buttons[1].action, TemplateAction::Url { .. }));
        assert!(matches!(template.buttons[2].action, TemplateAction::Call { .. }));
    }

    struct EchoClient;

    #[async_trait]
    impl ProtocolClient for EchoClient {
        async fn send(
            &self,
            jid: &Jid,
            message: &OutboundInteractiveMessage,
        ) -> Result<SendResult, SendError> {
            Ok(SendResult {
                key: MessageKey {
                    remote_jid: jid.to_string(),
                    id: format!("3EB0{}", message.kind().to_uppercase()),
                    from_me: true,
                },
            })
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn destination_sender_records_delivered_messages() {
        let history = Arc::new(MessageHistory::new(8, false));
        let sender = DestinationSender::new(Arc::new(EchoClient), Jid::normalize("5515991426667"))
            .with_history(Some(history.clone()));
        let report = InteractiveHarness::new(Duration::from_millis(1)).run(&sender).await;
        assert!(report.is_complete());

        for (key, step) in report.message_keys().into_iter().zip(HarnessStep::ALL) {
            let content = history.resolve(key).expect("sent message not recorded");
            let field = sample_message(step).content_key();
            assert!(content.other.contains_key(field), "{step}: missing {field}");
        }
    }
}
