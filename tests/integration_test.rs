//! Integration tests for flurry

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use flurry::classify::Classifier;
use flurry::error::ClassifyError;
use flurry::source::{InputItem, InputSet};
use flurry::{Config, Pipeline, ResumeMode, RunStatus};

mod config_tests {
    use super::*;
    use flurry::classify::parser::ResponseFormat;
    use flurry::source::InputFormat;

    #[test]
    fn test_config_file_parsing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("flurry.yaml");
        std::fs::write(
            &path,
            r#"
stage: assess
input:
  path: data/terms.ndjson
  key_field: term
output:
  path: data/assessed.ndjson
  work_dir: ${FLURRY_TEST_UNSET_WORK_DIR:-state}
batch:
  size: 50
  delay_ms: 500
  request_size: 10
  max_concurrent_requests: 5
retry:
  max_attempts: 4
  base_delay_ms: 250
  max_delay_ms: 8000
classifier:
  api_key: secret
  model: small-model
  response:
    format: assessment
    fields:
      - name: seasonal
        min: 0
        max: 5
      - name: gated
        min: 0
        max: 1
metrics:
  enabled: true
  address: "127.0.0.1:9100"
anomalies:
  path: data/anomalies.ndjson
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.stage, "assess");
        assert_eq!(config.input.key_field, "term");
        assert_eq!(config.input.format, InputFormat::Ndjson);
        assert_eq!(config.output.work_dir, Path::new("state"));
        assert_eq!(config.checkpoint_path(), Path::new("state/assess.checkpoint.json"));
        assert_eq!(config.batch.effective_request_size(), 10);
        assert_eq!(config.batch.max_concurrent_requests, 5);
        assert_eq!(config.retry.policy().max_attempts, 4);
        assert_eq!(config.classifier.model, "small-model");
        assert_eq!(config.classifier.response.format, ResponseFormat::Assessment);
        assert_eq!(config.classifier.response.fields.len(), 2);
        assert!(config.metrics.enabled);
        assert!(config.anomalies.path.is_some());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let yaml = r#"
input:
  path: terms.ndjson
output:
  path: out.ndjson
batch:
  size: 0
classifier:
  api_key: k
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_missing_env_var_is_reported() {
        let yaml = r#"
input:
  path: ${FLURRY_TEST_UNSET_INPUT}
output:
  path: out.ndjson
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("interpolation"));
    }
}

mod pipeline_tests {
    use super::*;
    use flurry::pipeline;
    use flurry::sink::{AnomalyKind, ItemOutcome, PartialRecord};

    /// Scores every item, but gives `bad` an out-of-range rating.
    struct AssessingClassifier;

    #[async_trait]
    impl Classifier for AssessingClassifier {
        async fn classify(&self, items: &[InputItem]) -> Result<String, ClassifyError> {
            Ok(items
                .iter()
                .map(|item| {
                    if item.key == "bad" {
                        format!("{}:9,0", item.key)
                    } else {
                        format!("\"{}\":3,1", item.key.to_uppercase())
                    }
                })
                .collect::<Vec<_>>()
                .join("; "))
        }
    }

    /// Fails fatally on the second call it receives.
    struct StopAfterFirst(AtomicBool);

    #[async_trait]
    impl Classifier for StopAfterFirst {
        async fn classify(&self, items: &[InputItem]) -> Result<String, ClassifyError> {
            if self.0.swap(true, Ordering::SeqCst) {
                return Err(ClassifyError::Fatal {
                    message: "invalid api key".into(),
                });
            }
            Ok(items
                .iter()
                .map(|item| format!("{}:ok", item.key))
                .collect::<Vec<_>>()
                .join(", "))
        }
    }

    fn write_config(dir: &Path, body: &str) -> Config {
        let path = dir.join("flurry.yaml");
        let yaml = format!(
            r#"
input:
  path: {dir}/terms.ndjson
  key_field: term
output:
  path: {dir}/out.ndjson
  work_dir: {dir}/work
{body}
classifier:
  api_key: test-key
  response:
    format: assessment
    fields:
      - name: specificity
        min: 0
        max: 5
      - name: gated
        min: 0
        max: 1
anomalies:
  path: {dir}/anomalies.ndjson
"#,
            dir = dir.display()
        );
        std::fs::write(&path, yaml).unwrap();
        Config::from_file(&path).unwrap()
    }

    fn write_input(dir: &Path) {
        std::fs::write(
            dir.join("terms.ndjson"),
            concat!(
                "{\"term\":\"garden hose\",\"volume\":1200}\n",
                "{\"term\":\"bad\",\"volume\":5}\n",
                "{\"term\":\"usb cable\",\"volume\":800}\n",
            ),
        )
        .unwrap();
    }

    async fn load(config: &Config) -> InputSet {
        InputSet::load(
            &config.input.path,
            config.input.format,
            &config.input.key_field,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_assessment_run() {
        let dir = tempfile::TempDir::new().unwrap();
        write_input(dir.path());
        let config = write_config(dir.path(), "batch:\n  size: 2\n  delay_ms: 0");
        let input = load(&config).await;

        let mut pipeline = Pipeline::new(
            config.clone(),
            Arc::new(AssessingClassifier),
            CancellationToken::new(),
        );
        let report = pipeline.run(&input, ResumeMode::Resume).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.total_batches, 2);
        assert_eq!(report.anomalies, 1);

        let rows: Vec<PartialRecord> = std::fs::read_to_string(&config.output.path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(rows.len(), 3);

        // Keys are matched case-insensitively and quotes are stripped.
        assert_eq!(rows[0].key, "garden hose");
        assert_eq!(rows[0].attributes["volume"], 1200);
        let ItemOutcome::Classified { fields } = &rows[0].outcome else {
            panic!("expected a classification, got {:?}", rows[0].outcome);
        };
        assert_eq!(fields["specificity"], 3);
        assert_eq!(fields["gated"], 1);

        assert_eq!(
            rows[1].outcome,
            ItemOutcome::Error {
                kind: AnomalyKind::Malformed,
                raw: Some("bad:9,0".into())
            }
        );
        assert!(rows[2].outcome.is_classified());

        let log = std::fs::read_to_string(dir.path().join("anomalies.ndjson")).unwrap();
        let entries: Vec<serde_json::Value> = log
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["key"], "bad");
        assert_eq!(entries[0]["kind"], "malformed");
        assert_eq!(entries[0]["batch_index"], 0);
    }

    #[tokio::test]
    async fn test_status_and_plan_after_stopped_run() {
        let dir = tempfile::TempDir::new().unwrap();
        write_input(dir.path());
        let config = write_config(dir.path(), "batch:\n  size: 1\n  delay_ms: 0");
        let input = load(&config).await;

        let mut pipeline = Pipeline::new(
            config.clone(),
            Arc::new(StopAfterFirst(AtomicBool::new(false))),
            CancellationToken::new(),
        );
        let report = pipeline.run(&input, ResumeMode::Resume).await.unwrap();
        assert_eq!(report.status, RunStatus::StoppedFatalError);

        let status = pipeline::status(&config, 5).await.unwrap();
        let cp = status.checkpoint.as_ref().unwrap();
        assert_eq!(cp.items_processed, 1);
        assert_eq!(cp.run_stats.errors.fatal, 1);
        assert_eq!(status.partial_rows, Some(1));
        assert_eq!(status.preview[0].key, "garden hose");
        assert!(status.to_string().contains("Processed:        1/3"));

        let plan = pipeline::plan(&config).await.unwrap();
        assert_eq!(plan.items, 3);
        assert_eq!(plan.total_batches, 3);
        assert!(plan.resumable);
        assert!(plan.to_string().contains("resumable from batch 1"));
    }
}
