use std::fmt::Write;

use crate::mastery::MasteryTracker;
use crate::models::{FeatureContribution, RiskLevel, RiskPrediction, SkillMastery};

pub struct SkillSummary {
    pub skills: usize,
    pub mastered: usize,
    pub avg_mastery: f64,
}

pub fn summarize_skills(tracker: &MasteryTracker, skills: &[SkillMastery]) -> SkillSummary {
    let mastered = skills
        .iter()
        .filter(|skill| tracker.is_mastered(skill.mastery))
        .count();
    let avg_mastery = if skills.is_empty() {
        0.0
    } else {
        skills.iter().map(|skill| skill.mastery).sum::<f64>() / skills.len() as f64
    };
    SkillSummary {
        skills: skills.len(),
        mastered,
        avg_mastery,
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct RosterSummary {
    pub students: usize,
    pub avg_risk: f64,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

pub fn summarize_roster(roster: &[RiskPrediction]) -> RosterSummary {
    if roster.is_empty() {
        return RosterSummary::default();
    }
    let count = |level: RiskLevel| roster.iter().filter(|p| p.risk_level == level).count();
    RosterSummary {
        students: roster.len(),
        avg_risk: roster.iter().map(|p| p.risk_score).sum::<f64>() / roster.len() as f64,
        high: count(RiskLevel::High),
        medium: count(RiskLevel::Medium),
        low: count(RiskLevel::Low),
    }
}

/// Contributions ordered by magnitude, largest first.
pub fn top_drivers(contributions: &[FeatureContribution], limit: usize) -> Vec<&FeatureContribution> {
    let mut drivers: Vec<&FeatureContribution> = contributions.iter().collect();
    drivers.sort_by(|a, b| b.value.abs().total_cmp(&a.value.abs()));
    drivers.truncate(limit);
    drivers
}

/// `history` is expected most recent first.
pub fn build_report(
    student_id: i64,
    tracker: &MasteryTracker,
    skills: &[SkillMastery],
    history: &[RiskPrediction],
) -> String {
    let summary = summarize_skills(tracker, skills);
    let mut output = String::new();

    let _ = writeln!(output, "# Learning Signal Report");
    let _ = writeln!(output, "Student {student_id}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Skill Mastery");

    if skills.is_empty() {
        let _ = writeln!(output, "No responses recorded yet.");
    } else {
        let _ = writeln!(
            output,
            "{} of {} skills mastered (avg mastery {:.2})",
            summary.mastered, summary.skills, summary.avg_mastery
        );
        let _ = writeln!(output);
        let _ = writeln!(output, "| skill | mastery | correct | incorrect | mastered |");
        let _ = writeln!(output, "|---|---|---|---|---|");

        let mut ordered = skills.to_vec();
        ordered.sort_by(|a, b| a.mastery.total_cmp(&b.mastery));
        for skill in &ordered {
            let _ = writeln!(
                output,
                "| {} | {:.4} | {} | {} | {} |",
                skill.skill_id,
                skill.mastery,
                skill.num_correct,
                skill.num_incorrect,
                if tracker.is_mastered(skill.mastery) { "yes" } else { "no" }
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Dropout Risk");

    match history.first() {
        None => {
            let _ = writeln!(output, "No risk predictions recorded yet.");
        }
        Some(latest) => {
            let _ = writeln!(
                output,
                "Latest: {} ({:.2}) on {} by {}",
                latest.risk_level,
                latest.risk_score,
                latest.predicted_at.format("%Y-%m-%d %H:%M"),
                latest.model
            );
            let _ = writeln!(output);
            let _ = writeln!(output, "Top drivers:");
            for driver in top_drivers(&latest.contributions, 3) {
                let _ = writeln!(output, "- {}: {:+.3}", driver.feature, driver.value);
            }
        }
    }

    if history.len() > 1 {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Risk History");
        for prediction in history.iter().take(10) {
            let _ = writeln!(
                output,
                "- {}: {} ({:.2})",
                prediction.predicted_at.format("%Y-%m-%d %H:%M"),
                prediction.risk_level,
                prediction.risk_score
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mastery::BktParams;
    use crate::models::{EngagementFeatures, ModelProvenance, RiskLevel};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn tracker() -> MasteryTracker {
        MasteryTracker::new(BktParams::default()).unwrap()
    }

    fn skill(skill_id: &str, mastery: f64, correct: i64, incorrect: i64) -> SkillMastery {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        SkillMastery {
            mastery,
            num_correct: correct,
            num_incorrect: incorrect,
            ..SkillMastery::fresh(7, skill_id, 0.5, now)
        }
    }

    fn prediction(score: f64, level: RiskLevel, day: u32) -> RiskPrediction {
        RiskPrediction {
            id: Uuid::new_v4(),
            student_id: 7,
            risk_score: score,
            risk_level: level,
            features: EngagementFeatures::default(),
            contributions: vec![
                FeatureContribution {
                    feature: "days_since_last_active".to_string(),
                    value: 0.2,
                },
                FeatureContribution {
                    feature: "avg_mastery".to_string(),
                    value: -0.05,
                },
                FeatureContribution {
                    feature: "correct_rate".to_string(),
                    value: 0.35,
                },
                FeatureContribution {
                    feature: "active_days".to_string(),
                    value: 0.01,
                },
            ],
            model: ModelProvenance::Heuristic,
            predicted_at: Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn summary_counts_mastered_skills() {
        let skills = vec![skill("algebra", 0.97, 6, 1), skill("geometry", 0.4, 1, 3)];
        let summary = summarize_skills(&tracker(), &skills);
        assert_eq!(summary.skills, 2);
        assert_eq!(summary.mastered, 1);
        assert!((summary.avg_mastery - 0.685).abs() < 1e-9);
    }

    #[test]
    fn drivers_ranked_by_magnitude() {
        let latest = prediction(0.6, RiskLevel::Medium, 2);
        let drivers = top_drivers(&latest.contributions, 2);
        assert_eq!(drivers[0].feature, "correct_rate");
        assert_eq!(drivers[1].feature, "days_since_last_active");
    }

    #[test]
    fn report_lists_skills_and_latest_risk() {
        let skills = vec![skill("algebra", 0.97, 6, 1), skill("geometry", 0.4, 1, 3)];
        let history = vec![
            prediction(0.72, RiskLevel::High, 3),
            prediction(0.5, RiskLevel::Medium, 1),
        ];
        let report = build_report(7, &tracker(), &skills, &history);

        assert!(report.starts_with("# Learning Signal Report"));
        assert!(report.contains("1 of 2 skills mastered"));
        assert!(report.contains("| geometry | 0.4000 | 1 | 3 | no |"));
        assert!(report.contains("| algebra | 0.9700 | 6 | 1 | yes |"));
        assert!(report.contains("Latest: high (0.72) on 2026-03-03 12:00 by heuristic"));
        assert!(report.contains("- correct_rate: +0.350"));
        assert!(report.contains("## Risk History"));
    }

    #[test]
    fn roster_summary_counts_levels() {
        let roster = vec![
            prediction(0.9, RiskLevel::High, 1),
            prediction(0.5, RiskLevel::Medium, 1),
            prediction(0.4, RiskLevel::Medium, 2),
            prediction(0.0, RiskLevel::Low, 2),
        ];
        let summary = summarize_roster(&roster);
        assert_eq!(summary.students, 4);
        assert!((summary.avg_risk - 0.45).abs() < 1e-12);
        assert_eq!((summary.high, summary.medium, summary.low), (1, 2, 1));
        assert_eq!(summarize_roster(&[]), RosterSummary::default());
    }

    #[test]
    fn empty_student_report() {
        let report = build_report(9, &tracker(), &[], &[]);
        assert!(report.contains("No responses recorded yet."));
        assert!(report.contains("No risk predictions recorded yet."));
        assert!(!report.contains("## Risk History"));
    }
}
