//! Interface de terminal do motor de escalonamento: spinner e saída colorida.
//!
//! Usa `indicatif` para o spinner de progresso e `console` para cores.
//! O [`RunProgress`] acompanha visualmente uma atualização forçada.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::audit::AuditEntry;
use crate::engine::BatchResult;
use crate::error::EscalationError;
use crate::state_machine::{Priority, Ticket};

/// Indicador visual de progresso para uma execução do motor.
pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    /// Inicia o spinner e retorna a instância de progresso.
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        // Template fixo; se falhar cai no estilo padrão.
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Finaliza o spinner e exibe o resumo do lote.
    ///
    /// Lote sem falhas em verde; falhas por ticket listadas em amarelo.
    pub fn complete(&self, result: &BatchResult) {
        self.pb.finish_and_clear();
        if result.is_clean() {
            println!("  {} {}", self.green.apply_to("✓"), result.summary());
        } else {
            println!("  {} {}", self.yellow.apply_to("!"), result.summary());
            for failed in &result.failed {
                println!(
                    "    {} {} [{}] {}",
                    self.red.apply_to("✗"),
                    failed.id,
                    failed.kind,
                    failed.error
                );
            }
        }
        for id in &result.successful_ids {
            println!("    {} {id}", self.green.apply_to("↑"));
        }
    }

    /// Remove o spinner quando o lote inteiro falha.
    pub fn abandon(&self) {
        self.pb.finish_and_clear();
    }
}

fn priority_style(priority: Priority) -> Style {
    match priority {
        Priority::Low => Style::new().dim(),
        Priority::Medium => Style::new().cyan(),
        Priority::High => Style::new().yellow(),
        Priority::Critical => Style::new().red().bold(),
    }
}

/// Imprime um ticket. Resolvido ou fechado, a prioridade aparece como
/// registro congelado.
pub fn print_ticket(ticket: &Ticket) {
    let breached = if ticket.sla_breached { " SLA breached" } else { "" };
    let priority = match ticket.effective_priority() {
        Some(priority) => priority_style(priority).apply_to(priority.to_string()),
        None => Style::new().dim().apply_to(format!("frozen:{}", ticket.priority)),
    };
    println!(
        "{} {} {} {}{}",
        Style::new().bold().apply_to(&ticket.id),
        ticket.category,
        ticket.status,
        priority,
        Style::new().red().apply_to(breached),
    );
}

/// Imprime a trilha de auditoria, uma linha por entrada.
pub fn print_audit(entries: &[AuditEntry]) {
    if entries.is_empty() {
        println!("{}", Style::new().dim().apply_to("no audit entries"));
        return;
    }
    println!("{}", Style::new().cyan().apply_to("─── Audit Trail ───"));
    for entry in entries {
        let before = entry
            .before
            .as_ref()
            .map(|s| format!("{}/{}", s.status, s.priority))
            .unwrap_or_else(|| "-".to_string());
        let reason = entry
            .reason
            .as_deref()
            .map(|r| format!(" ({r})"))
            .unwrap_or_default();
        println!(
            "{} {:<22} {:<16} {} -> {}/{}{}",
            Style::new().dim().apply_to(entry.occurred_at.to_rfc3339()),
            entry.action.to_string(),
            entry.actor,
            before,
            entry.after.status,
            priority_style(entry.after.priority).apply_to(entry.after.priority),
            reason
        );
    }
}

pub fn print_hours(hours: f64) {
    println!("{} working hours", Style::new().bold().apply_to(format!("{hours:.2}")));
}

/// Mostra um erro com o tipo específico, nunca uma falha genérica.
pub fn print_error(error: &EscalationError) {
    eprintln!(
        "  {} [{}] {error}",
        Style::new().red().bold().apply_to("✗"),
        error.kind()
    );
}
