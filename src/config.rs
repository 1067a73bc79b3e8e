//! Configuração do motor de escalonamento carregada a partir de `escalation.toml`.
//!
//! A struct [`EscalationConfig`] espelha o arquivo; valores ausentes usam
//! defaults sensíveis. [`Settings`] é a forma validada usada em tempo de
//! execução, e [`ConfigHandle`] permite recarregá-la sem reiniciar o processo.
//! A variável de ambiente `ESCALATION_CONFIG` escolhe o arquivo e
//! `ESCALATION_BIND` tem precedência sobre `server.bind`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{info, warn};

use crate::calendar::BusinessCalendar;
use crate::error::EscalationError;
use crate::policy::{CategoryRule, SlaPolicy, TierBoundaries, DEFAULT_THRESHOLD_HOURS};

const DEFAULT_CONFIG_FILE: &str = "escalation.toml";

/// Configuração de nível superior carregada de `escalation.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub calendar: CalendarConfig,

    #[serde(default)]
    pub sla: SlaConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Dias após o fechamento durante os quais o ticket pode ser reaberto.
    #[serde(default = "default_reopen_window_days")]
    pub reopen_window_days: i64,

    /// Tempo máximo de cada chamada ao repositório, em milissegundos.
    #[serde(default = "default_repository_timeout_ms")]
    pub repository_timeout_ms: u64,

    /// Quantos tickets o motor atualiza em paralelo numa mesma execução.
    #[serde(default = "default_max_concurrent_updates")]
    pub max_concurrent_updates: usize,

    /// Diretório com `tickets.json` e `audit.jsonl`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Agendamento periódico do recálculo de prioridades.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
}

/// Calendário comercial semanal.
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
    /// Nome IANA do fuso horário, por exemplo `Asia/Kolkata`.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_working_days")]
    pub working_days: Vec<String>,

    /// Início do expediente no formato `HH:MM`.
    #[serde(default = "default_day_start")]
    pub day_start: String,

    /// Fim do expediente no formato `HH:MM`.
    #[serde(default = "default_day_end")]
    pub day_end: String,
}

/// Tabela de SLA por categoria e limites de cada faixa de prioridade.
#[derive(Debug, Clone, Deserialize)]
pub struct SlaConfig {
    #[serde(default = "default_threshold_hours")]
    pub default_threshold_hours: f64,

    #[serde(default = "SlaPolicy::default_rules")]
    pub categories: Vec<CategoryRule>,

    #[serde(default)]
    pub tiers: TierBoundaries,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

// Valor padrão para a janela de reabertura: 7 dias.
fn default_reopen_window_days() -> i64 {
    7
}

// Valor padrão para o timeout do repositório: 5000ms.
fn default_repository_timeout_ms() -> u64 {
    5000
}

fn default_max_concurrent_updates() -> usize {
    8
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_true() -> bool {
    true
}

// Valor padrão para o intervalo do agendador: 3 minutos.
fn default_interval_minutes() -> u64 {
    3
}

fn default_timezone() -> String {
    "Asia/Kolkata".to_string()
}

// Segunda a sábado; domingo não é dia útil.
fn default_working_days() -> Vec<String> {
    ["mon", "tue", "wed", "thu", "fri", "sat"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

fn default_day_start() -> String {
    "09:00".to_string()
}

fn default_day_end() -> String {
    "17:00".to_string()
}

fn default_threshold_hours() -> f64 {
    DEFAULT_THRESHOLD_HOURS
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_minutes: default_interval_minutes(),
        }
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            working_days: default_working_days(),
            day_start: default_day_start(),
            day_end: default_day_end(),
        }
    }
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            default_threshold_hours: default_threshold_hours(),
            categories: SlaPolicy::default_rules(),
            tiers: TierBoundaries::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            calendar: CalendarConfig::default(),
            sla: SlaConfig::default(),
            server: ServerConfig::default(),
            reopen_window_days: default_reopen_window_days(),
            repository_timeout_ms: default_repository_timeout_ms(),
            max_concurrent_updates: default_max_concurrent_updates(),
            data_dir: default_data_dir(),
        }
    }
}

impl CalendarConfig {
    /// Converte a configuração textual num [`BusinessCalendar`].
    pub fn build(&self) -> Result<BusinessCalendar, EscalationError> {
        let tz = Tz::from_str(&self.timezone).map_err(|e| {
            EscalationError::Config(format!("unknown timezone {}: {e}", self.timezone))
        })?;

        let days = self
            .working_days
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| EscalationError::Config(format!("unknown weekday: {d}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        BusinessCalendar::new(
            tz,
            &days,
            parse_time(&self.day_start)?,
            parse_time(&self.day_end)?,
        )
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, EscalationError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|e| EscalationError::Config(format!("invalid time {s:?} (expected HH:MM): {e}")))
}

impl EscalationConfig {
    /// Resolve o caminho do arquivo: argumento explícito, depois
    /// `ESCALATION_CONFIG`, depois `escalation.toml` no diretório atual.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var("ESCALATION_CONFIG") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_CONFIG_FILE),
        }
    }

    /// Carrega a configuração do caminho resolvido.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit);
        let mut config = if path.exists() {
            Self::from_path(&path)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o endereço do servidor.
        if let Ok(bind) = std::env::var("ESCALATION_BIND") {
            if !bind.is_empty() {
                config.server.bind = bind;
            }
        }

        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str::<EscalationConfig>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Valida a configuração e produz os [`Settings`] de execução.
    pub fn settings(&self) -> Result<Settings, EscalationError> {
        if self.reopen_window_days < 0 {
            return Err(EscalationError::Config(
                "reopen_window_days must not be negative".into(),
            ));
        }
        if self.scheduler.interval_minutes == 0 {
            return Err(EscalationError::Config(
                "scheduler.interval_minutes must be at least 1".into(),
            ));
        }
        if self.max_concurrent_updates == 0 {
            return Err(EscalationError::Config(
                "max_concurrent_updates must be at least 1".into(),
            ));
        }
        if self.repository_timeout_ms == 0 {
            return Err(EscalationError::Config(
                "repository_timeout_ms must be at least 1".into(),
            ));
        }

        Ok(Settings {
            calendar: self.calendar.build()?,
            policy: SlaPolicy::new(
                self.sla.default_threshold_hours,
                self.sla.categories.clone(),
                self.sla.tiers,
            )?,
            reopen_window: chrono::Duration::days(self.reopen_window_days),
            repository_timeout: Duration::from_millis(self.repository_timeout_ms),
            max_concurrent_updates: self.max_concurrent_updates,
            scheduler_enabled: self.scheduler.enabled,
            scheduler_interval: Duration::from_secs(self.scheduler.interval_minutes * 60),
        })
    }
}

/// Parâmetros validados, compartilhados por motor, máquina de estados e agendador.
#[derive(Debug, Clone)]
pub struct Settings {
    pub calendar: BusinessCalendar,
    pub policy: SlaPolicy,
    pub reopen_window: chrono::Duration,
    pub repository_timeout: Duration,
    pub max_concurrent_updates: usize,
    pub scheduler_enabled: bool,
    pub scheduler_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            calendar: BusinessCalendar::default(),
            policy: SlaPolicy::default(),
            reopen_window: chrono::Duration::days(default_reopen_window_days()),
            repository_timeout: Duration::from_millis(default_repository_timeout_ms()),
            max_concurrent_updates: default_max_concurrent_updates(),
            scheduler_enabled: true,
            scheduler_interval: Duration::from_secs(default_interval_minutes() * 60),
        }
    }
}

/// Referência compartilhada e recarregável para os [`Settings`] atuais.
///
/// Leitores obtêm um `Arc<Settings>` consistente via [`current`](Self::current);
/// [`reload`](Self::reload) troca o conjunto inteiro atomicamente.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<ArcSwap<Settings>>,
    source: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(settings)),
            source: None,
        }
    }

    /// Cria um handle que sabe recarregar a partir de `path`.
    pub fn with_source(settings: Settings, path: impl Into<PathBuf>) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(settings)),
            source: Some(path.into()),
        }
    }

    pub fn current(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    /// Relê o arquivo de origem. Em caso de erro a configuração anterior
    /// continua valendo.
    pub fn reload(&self) -> Result<Arc<Settings>, EscalationError> {
        let Some(path) = self.source.as_deref() else {
            return Err(EscalationError::Config(
                "no configuration file to reload from".into(),
            ));
        };

        let settings = EscalationConfig::from_path(path)
            .map_err(|e| EscalationError::Config(format!("{e:#}")))
            .and_then(|config| config.settings());

        match settings {
            Ok(settings) => {
                let settings = Arc::new(settings);
                self.current.store(Arc::clone(&settings));
                info!(path = %path.display(), "configuration reloaded");
                Ok(settings)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "configuration reload rejected");
                Err(e)
            }
        }
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
