//! Interface de linha de comando do motor de escalonamento baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (serve, run, audit,
//! transition, reopen, create, hours) e flags globais (--config, --actor,
//! --verbose).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use crate::state_machine::{Priority, TicketStatus};

/// Motor de escalonamento de prioridade por SLA para o portal de reclamações.
#[derive(Debug, Parser)]
#[command(name = "grievance-sla", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração (padrão: `escalation.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Usuário registrado na trilha de auditoria.
    #[arg(long, global = true, default_value = "cli")]
    pub actor: String,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Status aceito pela CLI, mapeado para [`TicketStatus`] internamente.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl From<StatusArg> for TicketStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Open => TicketStatus::Open,
            StatusArg::InProgress => TicketStatus::InProgress,
            StatusArg::Resolved => TicketStatus::Resolved,
            StatusArg::Closed => TicketStatus::Closed,
        }
    }
}

/// Prioridade inicial aceita pela CLI.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
            PriorityArg::Critical => Priority::Critical,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inicia o agendador e o servidor HTTP até receber Ctrl-C.
    Serve,

    /// Executa uma atualização forçada de prioridades e mostra o resumo.
    Run,

    /// Mostra a trilha de auditoria de um ticket.
    Audit {
        /// Identificador do ticket.
        id: String,
    },

    /// Move um ticket para outro status.
    Transition {
        id: String,

        #[arg(value_enum)]
        status: StatusArg,
    },

    /// Reabre um ticket resolvido ou fechado dentro da janela de reabertura.
    Reopen {
        id: String,

        /// Motivo da reabertura.
        #[arg(long)]
        reason: String,
    },

    /// Cria um ticket aberto.
    Create {
        category: String,

        #[arg(long)]
        sub_category: Option<String>,

        #[arg(long, value_enum)]
        priority: Option<PriorityArg>,
    },

    /// Calcula horas úteis entre dois instantes RFC 3339.
    Hours {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}
