use std::fmt;

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod limits;
pub mod prod;
pub mod scheduler;
pub mod seq;
pub mod server;
pub mod submission;
pub mod telemetry;
pub mod worker;
pub mod writer;

pub use config::SchedConfig;
pub use error::{SchedError, SchedResult};
pub use scheduler::{JobOutcome, Scheduler};

/// A registered profile database, identified by the hash of its content.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Database {
    pub id: i64,
    pub hash64: i64,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum JobState {
    Pend,
    Run,
    Done,
    Fail,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Fail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pend => "pend",
            JobState::Run => "run",
            JobState::Done => "done",
            JobState::Fail => "fail",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub db_id: i64,
    pub multi_hits: bool,
    pub hmmer3_compat: bool,
    pub state: JobState,
    pub error: String,
    pub progress: i64,
    pub submission: i64,
    pub exec_started: Option<i64>,
    pub exec_ended: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Sequence {
    pub id: i64,
    pub job_id: i64,
    pub name: String,
    pub data: String,
}

/// A scoring result about to be recorded. Becomes a [`Product`] once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    pub job_id: i64,
    pub seq_id: i64,
    pub profile_name: String,
    pub abc_name: String,
    pub alt_loglik: f64,
    pub null_loglik: f64,
    pub profile_typeid: String,
    pub version: String,
    pub match_data: String,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Product {
    pub id: i64,
    pub job_id: i64,
    pub seq_id: i64,
    pub profile_name: String,
    pub abc_name: String,
    pub alt_loglik: f64,
    pub null_loglik: f64,
    pub profile_typeid: String,
    pub version: String,
    pub match_data: String,
}
