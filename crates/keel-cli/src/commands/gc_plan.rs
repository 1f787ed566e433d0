use chrono::{DateTime, Utc};
use keel_platform::ImageDetail;
use keel_reconcile::{Plan, plan_images};

use super::read_input;

pub fn gc_plan(input: &str, now: Option<&str>) -> anyhow::Result<()> {
    let images: Vec<ImageDetail> = serde_json::from_str(&read_input(input)?)?;
    let now = match now {
        Some(raw) => DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc),
        None => Utc::now(),
    };

    let plan = plan_images(images, now);
    tracing::info!(
        retain = plan.retain.len(),
        delete = plan.delete.len(),
        "planned image retention"
    );
    println!("{}", serde_json::to_string_pretty(&summarize(&plan))?);
    Ok(())
}

/// Digests only; the listing already has the rest.
fn summarize(plan: &Plan<ImageDetail>) -> Plan<&str> {
    Plan {
        retain: plan.retain.iter().map(|i| i.digest.as_str()).collect(),
        delete: plan.delete.iter().map(|i| i.digest.as_str()).collect(),
    }
}
