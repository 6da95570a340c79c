//! Core domain model for the daily horoscope service.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "horoscopo-core";

/// The twelve zodiac signs, in the fixed order the generation job walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ZodiacSign {
    #[serde(rename = "Áries")]
    Aries,
    #[serde(rename = "Touro")]
    Touro,
    #[serde(rename = "Gêmeos")]
    Gemeos,
    #[serde(rename = "Câncer")]
    Cancer,
    #[serde(rename = "Leão")]
    Leao,
    #[serde(rename = "Virgem")]
    Virgem,
    #[serde(rename = "Libra")]
    Libra,
    #[serde(rename = "Escorpião")]
    Escorpiao,
    #[serde(rename = "Sagitário")]
    Sagitario,
    #[serde(rename = "Capricórnio")]
    Capricornio,
    #[serde(rename = "Aquário")]
    Aquario,
    #[serde(rename = "Peixes")]
    Peixes,
}

impl ZodiacSign {
    /// Enumeration order is the processing and response order everywhere.
    pub const ALL: [ZodiacSign; 12] = [
        ZodiacSign::Aries,
        ZodiacSign::Touro,
        ZodiacSign::Gemeos,
        ZodiacSign::Cancer,
        ZodiacSign::Leao,
        ZodiacSign::Virgem,
        ZodiacSign::Libra,
        ZodiacSign::Escorpiao,
        ZodiacSign::Sagitario,
        ZodiacSign::Capricornio,
        ZodiacSign::Aquario,
        ZodiacSign::Peixes,
    ];

    /// Display label as stored and shown to users.
    pub fn label(self) -> &'static str {
        match self {
            ZodiacSign::Aries => "Áries",
            ZodiacSign::Touro => "Touro",
            ZodiacSign::Gemeos => "Gêmeos",
            ZodiacSign::Cancer => "Câncer",
            ZodiacSign::Leao => "Leão",
            ZodiacSign::Virgem => "Virgem",
            ZodiacSign::Libra => "Libra",
            ZodiacSign::Escorpiao => "Escorpião",
            ZodiacSign::Sagitario => "Sagitário",
            ZodiacSign::Capricornio => "Capricórnio",
            ZodiacSign::Aquario => "Aquário",
            ZodiacSign::Peixes => "Peixes",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.label() == label)
    }
}

impl std::fmt::Display for ZodiacSign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The generated body of a forecast, exactly the JSON object the
/// generative service is instructed to return. Only the summary is
/// required; every other field may be absent without blocking persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastContent {
    #[serde(rename = "resumo")]
    pub summary: String,
    #[serde(rename = "amor", default, skip_serializing_if = "Option::is_none")]
    pub love: Option<String>,
    #[serde(rename = "carreira", default, skip_serializing_if = "Option::is_none")]
    pub career: Option<String>,
    #[serde(rename = "bem_estar", default, skip_serializing_if = "Option::is_none")]
    pub wellness: Option<String>,
    #[serde(rename = "numero_da_sorte", default, skip_serializing_if = "Option::is_none")]
    pub lucky_number: Option<i32>,
    #[serde(rename = "cor_do_dia", default, skip_serializing_if = "Option::is_none")]
    pub color_of_day: Option<String>,
}

/// One persisted forecast row. At most one exists per (sign, day); the
/// store's unique constraint owns that invariant, not this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyForecast {
    #[serde(rename = "signo")]
    pub sign: ZodiacSign,
    #[serde(rename = "dia")]
    pub day: NaiveDate,
    #[serde(flatten)]
    pub content: ForecastContent,
}

impl DailyForecast {
    pub fn new(sign: ZodiacSign, day: NaiveDate, content: ForecastContent) -> Self {
        Self { sign, day, content }
    }
}

/// Terminal report of one generation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub day: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

/// What a completed (non-failed) run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every sign already had a row for the day; nothing was written.
    AlreadyComplete,
    /// The batch write succeeded for the listed signs (possibly none).
    Generated { signs: Vec<ZodiacSign> },
}

impl RunOutcome {
    pub fn count(&self) -> usize {
        match self {
            RunOutcome::AlreadyComplete => ZodiacSign::ALL.len(),
            RunOutcome::Generated { signs } => signs.len(),
        }
    }
}
