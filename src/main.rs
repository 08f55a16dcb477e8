use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use learnsignal::config::{AppConfig, RiskStrategy};
use learnsignal::db::{self, PgStore};
use learnsignal::logging;
use learnsignal::mastery::{MasteryService, MasteryTracker};
use learnsignal::models::EngagementFeatures;
use learnsignal::report;
use learnsignal::risk::dataset::Dataset;
use learnsignal::risk::service::RiskService;

#[derive(Parser)]
#[command(name = "learnsignal")]
#[command(about = "Skill mastery tracking and dropout risk scoring for learners", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo learners
    Seed,
    /// Replay answered questions from a CSV file (student_id,skill_id,correct)
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record one answered question
    #[command(group(
        ArgGroup::new("outcome")
            .args(["correct", "incorrect"])
            .required(true)
    ))]
    Answer {
        #[arg(long)]
        student: i64,
        #[arg(long)]
        skill: String,
        #[arg(long)]
        correct: bool,
        #[arg(long)]
        incorrect: bool,
    },
    /// Show mastery for one skill, or every skill the student has touched
    Mastery {
        #[arg(long)]
        student: i64,
        #[arg(long)]
        skill: Option<String>,
    },
    /// Score dropout risk from eight engagement signals
    Predict {
        #[arg(long)]
        student: i64,
        /// session_frequency,avg_messages_per_session,days_since_last_active,
        /// avg_session_length,avg_latency_ms,avg_mastery,correct_rate,active_days
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        features: Vec<f64>,
        #[arg(long)]
        force_refresh: bool,
    },
    /// List past risk predictions, newest first
    History {
        #[arg(long)]
        student: i64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Rank students by their latest risk score
    Roster {
        /// Only list students scoring at least this (0-1)
        #[arg(long, default_value_t = 0.0)]
        min_risk: f64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Fit the risk forest, save it and print the holdout report
    Train {
        #[arg(long, default_value_t = 500, conflicts_with = "csv")]
        samples: usize,
        #[arg(long, default_value_t = 42, conflicts_with = "csv")]
        seed: u64,
        /// Labeled history: the eight signal columns plus `label`
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Generate a markdown report for one student
    Report {
        #[arg(long)]
        student: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("invalid configuration")?;
    logging::init_tracing(&config.log_level);

    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set to a Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let tracker = MasteryTracker::new(config.bkt)?;
    let mastery = MasteryService::new(tracker, store.clone());
    let risk = RiskService::new(Arc::new(config.risk.build_scorer()), store)
        .with_cache_max_age(config.risk.cache_max_age);
    if config.risk.strategy == RiskStrategy::Forest && !matches!(cli.command, Commands::InitDb) {
        risk.restore_model()
            .await
            .context("failed to load the saved risk model")?;
    }

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&mastery, &risk).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let applied = db::import_csv(&mastery, &csv).await?;
            println!("Applied {applied} responses from {}.", csv.display());
        }
        Commands::Answer {
            student,
            skill,
            correct,
            incorrect: _,
        } => {
            let update = mastery.update_mastery(student, &skill, correct).await?;
            println!(
                "Student {student} on {skill}: mastery {:.4} ({} correct, {} incorrect){}",
                update.mastery,
                update.num_correct,
                update.num_incorrect,
                if update.is_mastered { " - mastered" } else { "" }
            );
        }
        Commands::Mastery { student, skill } => match skill {
            Some(skill) => {
                let view = mastery.get_mastery(student, &skill).await?;
                println!(
                    "Student {student} on {skill}: mastery {:.4} ({} correct, {} incorrect)",
                    view.mastery, view.num_correct, view.num_incorrect
                );
            }
            None => {
                let skills = mastery.student_skills(student).await?;
                if skills.is_empty() {
                    println!("No skills recorded for student {student}.");
                    return Ok(());
                }
                println!("Skills for student {student}:");
                for record in &skills {
                    println!(
                        "- {} mastery {:.4} ({} correct, {} incorrect){}",
                        record.skill_id,
                        record.mastery,
                        record.num_correct,
                        record.num_incorrect,
                        if mastery.tracker().is_mastered(record.mastery) {
                            " - mastered"
                        } else {
                            ""
                        }
                    );
                }
            }
        },
        Commands::Predict {
            student,
            features,
            force_refresh,
        } => {
            let features = EngagementFeatures::from_slice(&features)?;
            let prediction = risk.current_risk(student, features, force_refresh).await?;
            println!(
                "Student {student}: {} risk ({:.2}) from {}",
                prediction.risk_level, prediction.risk_score, prediction.model
            );
            for driver in report::top_drivers(&prediction.contributions, 3) {
                println!("- {}: {:+.3}", driver.feature, driver.value);
            }
        }
        Commands::History { student, limit } => {
            let history = risk.get_risk_history(student, limit).await?;
            if history.is_empty() {
                println!("No predictions recorded for student {student}.");
                return Ok(());
            }
            for prediction in &history {
                println!(
                    "- {} {} ({:.2}) from {}",
                    prediction.predicted_at.format("%Y-%m-%d %H:%M"),
                    prediction.risk_level,
                    prediction.risk_score,
                    prediction.model
                );
            }
        }
        Commands::Roster { min_risk, limit } => {
            let roster = risk.roster(min_risk, limit).await?;
            if roster.is_empty() {
                println!("No students at or above risk {min_risk:.2}.");
                return Ok(());
            }
            let summary = report::summarize_roster(&roster);
            println!(
                "{} students, avg risk {:.2} ({} high, {} medium, {} low):",
                summary.students, summary.avg_risk, summary.high, summary.medium, summary.low
            );
            for prediction in &roster {
                println!(
                    "- student {} {} ({:.2}) on {}",
                    prediction.student_id,
                    prediction.risk_level,
                    prediction.risk_score,
                    prediction.predicted_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Train { samples, seed, csv } => {
            let training = match csv {
                Some(path) => {
                    let dataset = Dataset::from_csv_path(&path)
                        .with_context(|| format!("failed to load {}", path.display()))?;
                    risk.train_historical(dataset).await?
                }
                None => risk.train_synthetic(samples, seed).await?,
            };
            println!(
                "Trained and saved {} on {} rows; holdout accuracy {:.3} over {} rows.",
                training.provenance, training.n_train, training.accuracy, training.n_test
            );
            println!("Feature importance:");
            for entry in report::top_drivers(&risk.feature_importance()?, 8) {
                println!("- {}: {:.3}", entry.feature, entry.value);
            }
        }
        Commands::Report { student, out } => {
            let skills = mastery.student_skills(student).await?;
            let history = risk.get_risk_history(student, 10).await?;
            let report = report::build_report(student, mastery.tracker(), &skills, &history);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
