use anyhow::Result;
use std::path::Path;

use super::config::TestDefinition;
use super::scenario::ScenarioWorkUnit;

/// Validate a test definition without running it.
/// Checks for:
/// - YAML/JSON syntax
/// - Option values (vus, durations, statuses)
/// - Threshold and check expressions
/// - Request methods and URLs
pub fn run_validate(path: &Path) -> Result<()> {
    println!("Validating {}...", path.display());

    let definition = match TestDefinition::load(path) {
        Ok(def) => {
            println!("  ✓ Definition parsed");
            def
        }
        Err(e) => {
            println!("  ✗ Validation failed: {}", e);
            return Err(e.into());
        }
    };

    let profile = match definition.options.into_profile() {
        Ok(profile) => {
            println!("  ✓ Options valid");
            println!("    vus: {}", profile.vus);
            println!("    duration: {:?}", profile.duration);
            let count: usize = profile.thresholds.values().map(Vec::len).sum();
            if count > 0 {
                println!("    thresholds: {} on {} metric(s)", count, profile.thresholds.len());
            }
            profile
        }
        Err(e) => {
            println!("  ✗ Options invalid: {}", e);
            return Err(e.into());
        }
    };

    match ScenarioWorkUnit::from_definition(&definition) {
        Ok(work) => println!("  ✓ {} request(s) valid", work.len()),
        Err(e) => {
            println!("  ✗ Requests invalid: {}", e);
            return Err(e.into());
        }
    }

    if profile.thresholds.is_empty() {
        println!("  ⚠ No thresholds defined (the run always passes)");
    }

    Ok(())
}
