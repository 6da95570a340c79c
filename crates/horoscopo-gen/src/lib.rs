//! Daily forecast generation: prompt construction, chat-completion client,
//! response recovery, and the idempotent backfill job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use horoscopo_core::{DailyForecast, ForecastContent, RunOutcome, RunSummary, ZodiacSign};
use horoscopo_store::{ForecastStore, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "horoscopo-gen";

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Process configuration, read from the environment exactly once and
/// validated before any work starts. Nothing else reads env vars.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub gen_api_key: String,
    pub gen_api_url: String,
    pub model: String,
    pub database_url: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub cron: String,
}

impl JobConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            gen_api_key: std::env::var("HOROSCOPO_GEN_API_KEY")
                .context("HOROSCOPO_GEN_API_KEY must be set")?,
            gen_api_url: std::env::var("HOROSCOPO_GEN_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            model: std::env::var("HOROSCOPO_GEN_MODEL")
                .unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            http_timeout_secs: std::env::var("HOROSCOPO_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            scheduler_enabled: std::env::var("HOROSCOPO_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: std::env::var("HOROSCOPO_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        })
    }
}

pub const SYSTEM_PERSONA: &str = "Você é uma astróloga experiente que escreve horóscopos \
diários para mulheres independentes. Seu tom é acolhedor, otimista e direto, sem clichês \
e sem promessas absolutas.";

/// Per-sign instruction. The output-format contract names the exact JSON
/// keys the decoder expects; anything outside the object is recovered by
/// the parser, not the prompt.
pub fn user_prompt(sign: ZodiacSign, day: NaiveDate) -> String {
    format!(
        "Escreva o horóscopo do dia {dia} para o signo de {signo}. \
         O campo \"resumo\" deve ter de 2 a 3 frases; os campos \"amor\", \"carreira\" e \
         \"bem_estar\" devem ter 1 frase cada; \"numero_da_sorte\" é um inteiro de 1 a 99; \
         \"cor_do_dia\" é o nome de uma cor. \
         Responda APENAS com um objeto JSON com as chaves \"resumo\", \"amor\", \
         \"carreira\", \"bem_estar\", \"numero_da_sorte\" e \"cor_do_dia\", \
         sem markdown e sem texto fora do objeto.",
        dia = day.format("%d/%m/%Y"),
        signo = sign.label(),
    )
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("response text is not valid JSON: {0}")]
    InvalidJson(serde_json::Error),
    #[error("response JSON does not match the forecast shape: {0}")]
    WrongShape(serde_json::Error),
    #[error("no JSON object found in response text")]
    NoJsonObject,
}

/// Decode the generative service's text into a `ForecastContent`.
///
/// The text may arrive fenced (```json … ```) or wrapped in prose. Fences
/// are stripped first and the remainder strict-parsed; if that is not
/// valid JSON, the first balanced `{…}` substring is extracted and parsed
/// instead. "Valid JSON, wrong shape" and "invalid JSON" are distinct
/// errors.
pub fn parse_forecast_content(raw: &str) -> Result<ForecastContent, ParseError> {
    let stripped = strip_code_fences(raw);

    let value = match serde_json::from_str::<serde_json::Value>(stripped) {
        Ok(value) => value,
        Err(strict_err) => {
            let Some(candidate) = extract_balanced_object(stripped) else {
                return Err(if stripped.contains('{') {
                    ParseError::InvalidJson(strict_err)
                } else {
                    ParseError::NoJsonObject
                });
            };
            serde_json::from_str(candidate).map_err(ParseError::InvalidJson)?
        }
    };

    serde_json::from_value(value).map_err(ParseError::WrongShape)
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence line itself ("```" or "```json").
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// First balanced `{…}` substring, tracking JSON string literals so braces
/// inside text do not skew the depth count.
fn extract_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("request to generative service failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("generative service returned http status {status}")]
    HttpStatus { status: u16 },
    #[error("generative service returned no completion choices")]
    EmptyCompletion,
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Seam for the external text-completion call: one stateless request per
/// sign, prompt in, structured payload out.
#[async_trait]
pub trait ForecastGenerator: Send + Sync {
    async fn generate(
        &self,
        sign: ZodiacSign,
        day: NaiveDate,
    ) -> Result<ForecastContent, GenerateError>;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Clone)]
pub struct ChatCompletionGenerator {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl ChatCompletionGenerator {
    pub fn new(config: &JobConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            api_url: config.gen_api_url.clone(),
            api_key: config.gen_api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ForecastGenerator for ChatCompletionGenerator {
    async fn generate(
        &self,
        sign: ZodiacSign,
        day: NaiveDate,
    ) -> Result<ForecastContent, GenerateError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PERSONA },
                { "role": "user", "content": user_prompt(sign, day) },
            ],
            "temperature": 0.8,
        });

        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GenerateError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let parsed: ChatResponse = resp.json().await?;
        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or(GenerateError::EmptyCompletion)?;
        Ok(parse_forecast_content(text)?)
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    /// Store failures (including a rejected batch) are fatal for the run.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The whole job: completeness check, per-sign generation with failure
/// isolation, single batch persist.
pub struct GenerationJob {
    store: Arc<dyn ForecastStore>,
    generator: Arc<dyn ForecastGenerator>,
}

impl GenerationJob {
    pub fn new(store: Arc<dyn ForecastStore>, generator: Arc<dyn ForecastGenerator>) -> Self {
        Self { store, generator }
    }

    pub async fn run(&self, day: NaiveDate) -> Result<RunSummary, JobError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let present = self.store.signs_for_day(day).await?;
        let missing: Vec<ZodiacSign> = ZodiacSign::ALL
            .into_iter()
            .filter(|sign| !present.contains(sign))
            .collect();

        if missing.is_empty() {
            info!(%run_id, %day, "all forecasts already generated");
            return Ok(RunSummary {
                run_id,
                day,
                started_at,
                finished_at: Utc::now(),
                outcome: RunOutcome::AlreadyComplete,
            });
        }

        let mut generated = Vec::with_capacity(missing.len());
        for sign in missing {
            match self.generator.generate(sign, day).await {
                Ok(content) => generated.push(DailyForecast::new(sign, day, content)),
                Err(err) => {
                    // A single sign failing never aborts the batch.
                    warn!(%run_id, signo = %sign, %day, error = %err, "forecast generation failed, skipping sign");
                }
            }
        }

        let signs: Vec<ZodiacSign> = generated.iter().map(|f| f.sign).collect();
        let count = self.store.insert_batch(&generated).await?;
        info!(%run_id, %day, count, "forecast batch persisted");

        debug_assert_eq!(count, signs.len());
        Ok(RunSummary {
            run_id,
            day,
            started_at,
            finished_at: Utc::now(),
            outcome: RunOutcome::Generated { signs },
        })
    }
}

/// Optional unattended daily trigger; the HTTP route stays the primary
/// entry point.
pub async fn maybe_build_scheduler(
    config: &JobConfig,
    job: Arc<GenerationJob>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.cron.clone();
    let scheduled = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let job = job.clone();
        Box::pin(async move {
            let today = Utc::now().date_naive();
            match job.run(today).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    count = summary.outcome.count(),
                    "scheduled forecast run finished"
                ),
                Err(err) => warn!(error = %err, "scheduled forecast run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(scheduled).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use horoscopo_store::MemoryForecastStore;
    use tokio::sync::Barrier;

    const INNER_JSON: &str = r#"{"resumo":"Dia de decisões importantes.","amor":"Converse com calma.","carreira":"Boa fase para negociar.","bem_estar":"Alongue o corpo pela manhã.","numero_da_sorte":21,"cor_do_dia":"Verde"}"#;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 27).unwrap()
    }

    mod parsing {
        use super::*;

        #[test]
        fn strict_json_parses() {
            let content = parse_forecast_content(INNER_JSON).unwrap();
            assert_eq!(content.lucky_number, Some(21));
            assert_eq!(content.color_of_day.as_deref(), Some("Verde"));
        }

        #[test]
        fn fenced_json_equals_inner_parse() {
            let fenced = format!("```json\n{INNER_JSON}\n```");
            assert_eq!(
                parse_forecast_content(&fenced).unwrap(),
                parse_forecast_content(INNER_JSON).unwrap()
            );
        }

        #[test]
        fn bare_fence_without_language_tag() {
            let fenced = format!("```\n{INNER_JSON}\n```");
            assert!(parse_forecast_content(&fenced).is_ok());
        }

        #[test]
        fn surrounding_prose_falls_back_to_balanced_extraction() {
            let wrapped = format!("Claro! Aqui está o horóscopo:\n{INNER_JSON}\nBom dia!");
            let content = parse_forecast_content(&wrapped).unwrap();
            assert_eq!(content.summary, "Dia de decisões importantes.");
        }

        #[test]
        fn braces_inside_strings_do_not_break_extraction() {
            let text = r#"prefixo {"resumo":"Texto com \"aspas\" e {chaves}."} sufixo"#;
            let content = parse_forecast_content(text).unwrap();
            assert!(content.summary.contains("{chaves}"));

            // Extraction takes the FIRST balanced object, even when a
            // later one would parse; that earlier garbage is invalid JSON.
            let tricky = format!(
                "nota: use {{chaves}} com cuidado {}",
                r#"{"resumo":"ok"}"#
            );
            assert!(matches!(
                parse_forecast_content(&tricky),
                Err(ParseError::InvalidJson(_))
            ));
        }

        #[test]
        fn invalid_json_and_wrong_shape_are_distinct() {
            assert!(matches!(
                parse_forecast_content("{resumo: sem aspas}"),
                Err(ParseError::InvalidJson(_))
            ));
            assert!(matches!(
                parse_forecast_content(r#"{"foo":"bar"}"#),
                Err(ParseError::WrongShape(_))
            ));
            assert!(matches!(
                parse_forecast_content("sem objeto nenhum"),
                Err(ParseError::NoJsonObject)
            ));
        }

        #[test]
        fn lucky_number_must_be_an_integer() {
            assert!(matches!(
                parse_forecast_content(r#"{"resumo":"ok","numero_da_sorte":"sete"}"#),
                Err(ParseError::WrongShape(_))
            ));
        }
    }

    struct ScriptedGenerator {
        failing: HashSet<ZodiacSign>,
        barrier: Option<Arc<Barrier>>,
    }

    impl ScriptedGenerator {
        fn ok() -> Self {
            Self {
                failing: HashSet::new(),
                barrier: None,
            }
        }

        fn failing_for(signs: impl IntoIterator<Item = ZodiacSign>) -> Self {
            Self {
                failing: signs.into_iter().collect(),
                barrier: None,
            }
        }
    }

    #[async_trait]
    impl ForecastGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            sign: ZodiacSign,
            _day: NaiveDate,
        ) -> Result<ForecastContent, GenerateError> {
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            if self.failing.contains(&sign) {
                return Err(GenerateError::HttpStatus { status: 429 });
            }
            Ok(ForecastContent {
                summary: format!("Previsão para {sign}."),
                love: Some("Dia leve.".into()),
                career: Some("Foco no essencial.".into()),
                wellness: None,
                lucky_number: Some(8),
                color_of_day: Some("Lilás".into()),
            })
        }
    }

    fn job_with(
        store: Arc<MemoryForecastStore>,
        generator: ScriptedGenerator,
    ) -> GenerationJob {
        GenerationJob::new(store, Arc::new(generator))
    }

    #[tokio::test]
    async fn empty_day_generates_all_twelve_in_order() {
        let store = Arc::new(MemoryForecastStore::new());
        let job = job_with(store.clone(), ScriptedGenerator::ok());

        let summary = job.run(day()).await.unwrap();
        match &summary.outcome {
            RunOutcome::Generated { signs } => {
                assert_eq!(signs.as_slice(), ZodiacSign::ALL.as_slice());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(summary.outcome.count(), 12);
        assert_eq!(store.len().await, 12);
        assert!(store
            .get(ZodiacSign::Capricornio, day())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn second_run_is_a_no_op_with_full_count() {
        let store = Arc::new(MemoryForecastStore::new());
        let job = job_with(store.clone(), ScriptedGenerator::ok());

        job.run(day()).await.unwrap();
        let second = job.run(day()).await.unwrap();

        assert_eq!(second.outcome, RunOutcome::AlreadyComplete);
        assert_eq!(second.outcome.count(), 12);
        assert_eq!(store.len().await, 12);
    }

    #[tokio::test]
    async fn one_failing_sign_is_dropped_not_fatal() {
        let store = Arc::new(MemoryForecastStore::new());
        let job = job_with(
            store.clone(),
            ScriptedGenerator::failing_for([ZodiacSign::Gemeos]),
        );

        let summary = job.run(day()).await.unwrap();
        match &summary.outcome {
            RunOutcome::Generated { signs } => {
                assert_eq!(signs.len(), 11);
                assert!(!signs.contains(&ZodiacSign::Gemeos));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.len().await, 11);
        assert!(store.get(ZodiacSign::Gemeos, day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backfill_fills_only_the_gap() {
        let store = Arc::new(MemoryForecastStore::new());
        let first = job_with(
            store.clone(),
            ScriptedGenerator::failing_for([ZodiacSign::Aquario, ZodiacSign::Touro]),
        );
        first.run(day()).await.unwrap();
        assert_eq!(store.len().await, 10);

        let second = job_with(store.clone(), ScriptedGenerator::ok());
        let summary = second.run(day()).await.unwrap();
        match &summary.outcome {
            RunOutcome::Generated { signs } => {
                assert_eq!(
                    signs.as_slice(),
                    &[ZodiacSign::Touro, ZodiacSign::Aquario],
                    "backfill preserves enumeration order"
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.len().await, 12);
    }

    #[tokio::test]
    async fn all_failures_still_report_success_with_zero_count() {
        let store = Arc::new(MemoryForecastStore::new());
        let job = job_with(
            store.clone(),
            ScriptedGenerator::failing_for(ZodiacSign::ALL),
        );

        let summary = job.run(day()).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Generated { signs: vec![] });
        assert_eq!(summary.outcome.count(), 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_runs_persist_exactly_twelve_rows() {
        let store = Arc::new(MemoryForecastStore::new());
        // Both runs pass the completeness check before either generates:
        // the barrier releases only once each first generation call is
        // in flight, so both judge all twelve signs missing.
        let barrier = Arc::new(Barrier::new(2));
        let mk_job = |barrier: Arc<Barrier>| {
            GenerationJob::new(
                store.clone(),
                Arc::new(ScriptedGenerator {
                    failing: HashSet::new(),
                    barrier: Some(barrier),
                }),
            )
        };
        let job_a = mk_job(barrier.clone());
        let job_b = mk_job(barrier);

        let (a, b) = tokio::join!(job_a.run(day()), job_b.run(day()));
        let outcomes = [a, b];

        let wins = outcomes
            .iter()
            .filter(|r| matches!(r, Ok(s) if s.outcome.count() == 12))
            .count();
        let duplicate_losses = outcomes
            .iter()
            .filter(|r| matches!(r, Err(JobError::Store(StoreError::Duplicate))))
            .count();

        assert_eq!(wins, 1, "exactly one run wins the batch insert");
        assert_eq!(duplicate_losses, 1, "the loser's whole batch is rejected");
        assert_eq!(store.len().await, 12);
    }

    // Single test so the env mutations cannot race a parallel sibling.
    #[test]
    fn config_requires_secrets_and_defaults_the_rest() {
        for var in [
            "HOROSCOPO_GEN_API_KEY",
            "DATABASE_URL",
            "HOROSCOPO_GEN_API_URL",
            "HOROSCOPO_GEN_MODEL",
            "HOROSCOPO_HTTP_TIMEOUT_SECS",
            "HOROSCOPO_SCHEDULER_ENABLED",
            "HOROSCOPO_CRON",
        ] {
            std::env::remove_var(var);
        }
        let err = JobConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("HOROSCOPO_GEN_API_KEY"));

        std::env::set_var("HOROSCOPO_GEN_API_KEY", "sk-test");
        let err = JobConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        std::env::set_var("DATABASE_URL", "postgres://horoscopo@localhost/horoscopo");
        let config = JobConfig::from_env().unwrap();
        assert_eq!(config.gen_api_url, DEFAULT_API_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.http_timeout_secs, 30);
        assert!(!config.scheduler_enabled);

        std::env::remove_var("HOROSCOPO_GEN_API_KEY");
        std::env::remove_var("DATABASE_URL");
    }

    #[test]
    fn prompt_names_the_sign_and_the_output_contract() {
        let prompt = user_prompt(ZodiacSign::Escorpiao, day());
        assert!(prompt.contains("Escorpião"));
        assert!(prompt.contains("27/08/2026"));
        assert!(prompt.contains("numero_da_sorte"));
        assert!(prompt.contains("APENAS"));
    }
}
