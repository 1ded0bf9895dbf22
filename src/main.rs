mod analyzer;
mod loader;
mod models;
mod stats;

use analyzer::{CorrelationAnalyzer, CorrelationReport};
use anyhow::{Context, Result};
use clap::{Arg, Command};
use loader::{DatasetCache, DatasetLoader};
use models::{Config, PredictorConfig, SchoolKeyer, DEFAULT_KEY_PREFIX_TOKENS};
use stats::{Correlation, LinearFit, Strength};
use std::fs;
use std::path::Path;

/// Display-layer convention only; the engine reports raw p-values.
const SIGNIFICANCE_ALPHA: f64 = 0.05;

fn main() -> Result<()> {
    let matches = Command::new("korelasi-analyzer")
        .version("1.0")
        .about("Analyzes the correlation between teacher digital literacy and student computational thinking")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .get_matches();

    let config_file = matches.get_one::<String>("config").unwrap();

    // Load or create configuration
    let config = if Path::new(config_file).exists() {
        println!("📋 Loading configuration from: {}", config_file);
        Config::load_from_file(config_file)?
    } else {
        println!("📝 Creating default configuration file: {}", config_file);
        let default_config = Config::default();
        default_config.save_to_file(config_file)?;
        println!(
            "⚠️  Please edit {} and point it at your survey CSV files, then run the program again.",
            config_file
        );
        return Ok(());
    };

    let output_dir = config.output_directory.as_deref().unwrap_or("output");
    fs::create_dir_all(output_dir)?;
    clean_output_directory(output_dir)?;

    println!("👩‍🏫 Teacher data: {}", config.teacher_data_file);
    println!("👨‍🎓 Student data: {}", config.student_data_file);
    println!("📄 Output directory: {} (cleaned)", output_dir);
    if let Some(levels) = &config.levels_of_interest {
        println!("🎯 Levels of interest: {}", levels.join(", "));
    } else {
        println!("🎯 Levels of interest: ALL LEVELS");
    }

    // Load both survey tables through the keyed cache
    let data_loader = DatasetLoader::new(config.delimiter);
    let mut cache = DatasetCache::new();
    let dataset = cache
        .load(
            &data_loader,
            Path::new(&config.teacher_data_file),
            Path::new(&config.student_data_file),
        )
        .context("failed to load the survey tables")?;

    println!(
        "✅ Loaded {} teacher rows and {} student rows",
        dataset.teachers.len(),
        dataset.students.len()
    );

    // Run the three-tier correlation analysis
    let keyer = SchoolKeyer::new(config.key_prefix_tokens.unwrap_or(DEFAULT_KEY_PREFIX_TOKENS));
    let correlation_analyzer =
        CorrelationAnalyzer::new(keyer).with_levels_of_interest(config.levels_of_interest.clone());
    let report = correlation_analyzer.analyze(&dataset);

    if report.matched_schools.is_empty() {
        println!("❌ No school appears in both surveys; nothing to correlate.");
        return Ok(());
    }
    println!("🔗 Matched schools: {}", report.matched_schools.len());

    // Generate reports
    generate_school_aggregates_csv(&report, output_dir)?;
    generate_level_correlations_csv(&report, output_dir)?;
    generate_school_level_csv(&report, output_dir)?;
    generate_summary_report(&report, output_dir)?;
    generate_prediction_report(&config, &report, output_dir)?;

    print_summary(&report);

    println!("\n✅ Analysis complete!");
    println!("📂 Results written to: {}", output_dir);
    Ok(())
}

fn interpret(correlation: Option<&Correlation>) -> &'static str {
    match correlation {
        None => "Insufficient data",
        Some(c) if c.p_value < SIGNIFICANCE_ALPHA => "Significant",
        Some(_) => "Not significant",
    }
}

fn mean_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return None;
    }
    Some(collected.iter().sum::<f64>() / collected.len() as f64)
}

fn generate_school_aggregates_csv(report: &CorrelationReport, output_dir: &str) -> Result<()> {
    let csv_path = Path::new(output_dir).join("school_aggregates.csv");
    let mut writer = csv::Writer::from_path(csv_path)?;

    writer.write_record([
        "School_Key",
        "LD_Teacher_Mean",
        "CT_Student_Mean",
        "Teacher_Rows",
        "Student_Rows",
    ])?;

    for row in &report.school_aggregates {
        writer.write_record(&[
            row.school_key.clone(),
            format!("{:.3}", row.ld_mean),
            format!("{:.3}", row.ct_mean),
            row.teacher_rows.to_string(),
            row.student_rows.to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn generate_level_correlations_csv(report: &CorrelationReport, output_dir: &str) -> Result<()> {
    let csv_path = Path::new(output_dir).join("level_correlations.csv");
    let mut writer = csv::Writer::from_path(csv_path)?;

    writer.write_record([
        "Level",
        "Matched_Schools",
        "Spearman_r",
        "p_value",
        "Interpretation",
    ])?;

    for level in &report.level_correlations {
        let (r, p) = match &level.correlation {
            Some(c) => (format!("{:.3}", c.r), format!("{:.3}", c.p_value)),
            None => (String::new(), String::new()),
        };
        writer.write_record(&[
            level.level.clone(),
            level.school_count.to_string(),
            r,
            p,
            interpret(level.correlation.as_ref()).to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn generate_school_level_csv(report: &CorrelationReport, output_dir: &str) -> Result<()> {
    let csv_path = Path::new(output_dir).join("school_level_correlations.csv");
    let mut writer = csv::Writer::from_path(csv_path)?;

    writer.write_record([
        "School_Key",
        "Shared_Levels",
        "Pearson_r",
        "p_value",
        "Interpretation",
    ])?;

    for school in &report.school_level_correlations {
        let (r, p) = match &school.correlation {
            Some(c) => (format!("{:.3}", c.r), format!("{:.3}", c.p_value)),
            None => (String::new(), String::new()),
        };
        writer.write_record(&[
            school.school_key.clone(),
            school.level_rows.len().to_string(),
            r,
            p,
            interpret(school.correlation.as_ref()).to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn generate_summary_report(report: &CorrelationReport, output_dir: &str) -> Result<()> {
    let mut content = String::new();
    content.push_str("Correlation Summary: Teacher Digital Literacy vs Student CT\n");
    content.push_str("===========================================================\n\n");
    content.push_str(&format!(
        "Matched schools: {}\n\n",
        report.matched_schools.len()
    ));

    match &report.overall {
        Some(c) => {
            content.push_str(&format!("Spearman r: {:.3}\n", c.r));
            content.push_str(&format!("p-value: {:.3}\n", c.p_value));
            content.push_str(&format!("Strength: {}\n", Strength::band(c.r)));
            content.push_str(if c.p_value < SIGNIFICANCE_ALPHA {
                "Statistically significant relationship\n\n"
            } else {
                "Relationship not statistically significant\n\n"
            });
        }
        None => {
            content.push_str("Not enough matched schools for a whole-dataset correlation.\n\n");
        }
    }

    content.push_str("Per-level correlations across schools:\n");
    for level in &report.level_correlations {
        match &level.correlation {
            Some(c) => content.push_str(&format!(
                "   {} - {} schools, Spearman r {:.3}, p {:.3} ({})\n",
                level.level,
                level.school_count,
                c.r,
                c.p_value,
                Strength::band(c.r)
            )),
            None => content.push_str(&format!(
                "   {} - {} schools, not enough matched schools at this level\n",
                level.level, level.school_count
            )),
        }
    }

    fs::write(Path::new(output_dir).join("correlation_summary.txt"), content)?;
    Ok(())
}

fn generate_prediction_report(
    config: &Config,
    report: &CorrelationReport,
    output_dir: &str,
) -> Result<()> {
    let mut content = String::new();
    content.push_str("Predicted Student CT From Teacher Digital Literacy\n");
    content.push_str("==================================================\n\n");

    let predictor = config.predictor.clone().unwrap_or(PredictorConfig {
        intercept: None,
        slope: None,
        input: None,
    });

    let fit = match (predictor.intercept, predictor.slope) {
        (Some(intercept), Some(slope)) => {
            content.push_str("Coefficients: fixed in configuration\n");
            Some(LinearFit::new(intercept, slope))
        }
        _ => {
            let xs: Vec<f64> = report.school_aggregates.iter().map(|a| a.ld_mean).collect();
            let ys: Vec<f64> = report.school_aggregates.iter().map(|a| a.ct_mean).collect();
            match LinearFit::fit(&xs, &ys) {
                Ok(fit) => {
                    content.push_str("Coefficients: least squares over the school aggregate\n");
                    Some(fit)
                }
                Err(e) => {
                    content.push_str(&format!("Not enough data to fit a prediction line: {}\n", e));
                    None
                }
            }
        }
    };

    if let Some(fit) = fit {
        content.push_str(&format!("Intercept: {:.4}\n", fit.intercept));
        content.push_str(&format!("Slope: {:.4}\n\n", fit.slope));

        let observed_ld = mean_of(report.school_aggregates.iter().map(|a| a.ld_mean));
        let observed_ct = mean_of(report.school_aggregates.iter().map(|a| a.ct_mean));
        match predictor.input.or(observed_ld) {
            Some(x) => {
                let predicted = fit.predict(x);
                content.push_str(&format!("Input (mean teacher LD): {:.3}\n", x));
                content.push_str(&format!("Predicted student CT: {:.4}\n", predicted));
                if let Some(ct_mean) = observed_ct {
                    let comparison = if predicted > ct_mean { "above" } else { "below" };
                    content.push_str(&format!(
                        "The prediction is {} the observed student CT mean of {:.3}.\n",
                        comparison, ct_mean
                    ));
                }
            }
            None => {
                content.push_str(
                    "No prediction input: the school aggregate is empty and no input was configured.\n",
                );
            }
        }
    }

    fs::write(Path::new(output_dir).join("prediction.txt"), content)?;
    Ok(())
}

fn print_summary(report: &CorrelationReport) {
    println!("\n📊 SUMMARY");
    println!("==========\n");

    match &report.overall {
        Some(c) => {
            println!(
                "📈 Across {} matched schools: Spearman r = {:.3}, p = {:.3} ({}, {})",
                report.matched_schools.len(),
                c.r,
                c.p_value,
                Strength::band(c.r),
                if c.p_value < SIGNIFICANCE_ALPHA {
                    "significant"
                } else {
                    "not significant"
                }
            );
        }
        None => println!("📈 Not enough matched schools for a whole-dataset correlation"),
    }

    println!("\n📊 Per level:");
    for (i, level) in report.level_correlations.iter().enumerate() {
        match &level.correlation {
            Some(c) => println!(
                "   {}. {} - {} schools, r = {:.3}, p = {:.3}",
                i + 1,
                level.level,
                level.school_count,
                c.r,
                c.p_value
            ),
            None => println!(
                "   {}. {} - {} schools (insufficient data)",
                i + 1,
                level.level,
                level.school_count
            ),
        }
    }

    let computed = report
        .school_level_correlations
        .iter()
        .filter(|s| s.correlation.is_some())
        .count();
    println!(
        "\n🏫 Within-school correlations: {} of {} schools had enough shared levels",
        computed,
        report.school_level_correlations.len()
    );
}

// Clean up previous results from output directory
fn clean_output_directory(output_dir: &str) -> Result<()> {
    let output_path = Path::new(output_dir);

    if !output_path.exists() {
        return Ok(());
    }

    let items_to_clean = [
        "school_aggregates.csv",
        "level_correlations.csv",
        "school_level_correlations.csv",
        "correlation_summary.txt",
        "prediction.txt",
    ];

    for item in &items_to_clean {
        let item_path = output_path.join(item);
        if item_path.is_file() {
            fs::remove_file(&item_path)?;
        }
    }

    Ok(())
}
