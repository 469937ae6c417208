//! Compiles a [`PipelineDef`] into persisted pipeline/job/step rows and an
//! in-memory [`Dag`] over job names.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use arcade_db::queries::pipelines as pipelines_db;

use crate::dag::Dag;

use super::definition::PipelineDef;

/// The persisted identifiers and in-memory graph produced by compiling a
/// pipeline definition into a fresh run.
pub struct CompiledRun {
    pub pipeline_id: Uuid,
    pub run_id: Uuid,
    /// Maps job name to its persisted job id.
    pub job_ids: std::collections::HashMap<String, Uuid>,
    pub dag: Dag,
}

/// Validate and persist a pipeline definition, then start a new run: insert
/// the pipeline (if not already known), a run row, every job and its
/// dependency edges, every step, and build the corresponding [`Dag`].
pub async fn compile_pipeline(pool: &PgPool, def: &PipelineDef) -> Result<CompiledRun> {
    validate(def)?;

    let definition_json = serde_json::to_value(def).context("failed to serialize pipeline definition")?;
    let pipeline = pipelines_db::insert_pipeline(pool, &def.name, &definition_json)
        .await
        .context("failed to persist pipeline")?;
    let run = pipelines_db::insert_run(pool, pipeline.id)
        .await
        .context("failed to start pipeline run")?;

    let mut dag = Dag::new();
    let mut job_ids = std::collections::HashMap::new();

    // Jobs must be inserted in an order where every dependency already
    // exists, both for the DAG (add_node requires known predecessors) and
    // for the job_dependencies foreign keys.
    for job in topological_order(def)? {
        let row = pipelines_db::insert_job(pool, run.id, &job.name)
            .await
            .with_context(|| format!("failed to persist job {:?}", job.name))?;
        job_ids.insert(job.name.clone(), row.id);

        let prev: Vec<&str> = job.prev_job_names.iter().map(|s| s.as_str()).collect();
        dag.add_node(job.name.clone(), &prev)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        for dep_name in &job.prev_job_names {
            let dep_id = job_ids[dep_name];
            pipelines_db::insert_job_dependency(pool, row.id, dep_id)
                .await
                .with_context(|| format!("failed to persist dependency {} -> {}", job.name, dep_name))?;
        }

        for (sequence, step) in job.steps.iter().enumerate() {
            pipelines_db::insert_step(pool, row.id, &step.name, &step.kind, &step.params, sequence as i32)
                .await
                .with_context(|| format!("failed to persist step {:?}", step.name))?;
        }
    }

    if let Some(cycle) = dag.detect_cycle() {
        bail!("pipeline {:?} has a cyclic job dependency: {cycle}", def.name);
    }

    Ok(CompiledRun {
        pipeline_id: pipeline.id,
        run_id: run.id,
        job_ids,
        dag,
    })
}

fn validate(def: &PipelineDef) -> Result<()> {
    if def.jobs.is_empty() {
        bail!("pipeline {:?} has no jobs", def.name);
    }

    let mut seen = std::collections::HashSet::new();
    for job in &def.jobs {
        if !seen.insert(job.name.as_str()) {
            bail!("pipeline {:?} has duplicate job name {:?}", def.name, job.name);
        }
    }
    for job in &def.jobs {
        for dep in &job.prev_job_names {
            if !seen.contains(dep.as_str()) {
                bail!(
                    "job {:?} in pipeline {:?} depends on unknown job {:?}",
                    job.name,
                    def.name,
                    dep
                );
            }
        }
    }
    Ok(())
}

/// Order jobs so every job appears after all of its `prev_job_names`.
/// Validation above guarantees every referenced name exists; this only
/// needs to reject cycles, which it does by detecting no progress.
fn topological_order(def: &PipelineDef) -> Result<Vec<&super::definition::JobDef>> {
    let mut remaining: Vec<&super::definition::JobDef> = def.jobs.iter().collect();
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut placed: std::collections::HashSet<&str> = std::collections::HashSet::new();

    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|job| {
            if job.prev_job_names.iter().all(|dep| placed.contains(dep.as_str())) {
                placed.insert(job.name.as_str());
                ordered.push(*job);
                false
            } else {
                true
            }
        });
        if remaining.len() == before {
            bail!("pipeline {:?} has a cyclic job dependency", def.name);
        }
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::definition::{JobDef, StepDef};

    fn def_with(jobs: Vec<JobDef>) -> PipelineDef {
        PipelineDef {
            name: "ci".to_string(),
            namespace: "default".to_string(),
            workspace_root: "/workspace".to_string(),
            jobs,
        }
    }

    fn job(name: &str, prev: &[&str]) -> JobDef {
        JobDef {
            name: name.to_string(),
            prev_job_names: prev.iter().map(|s| s.to_string()).collect(),
            steps: vec![StepDef {
                name: "noop".to_string(),
                kind: "shell_command".to_string(),
                params: serde_json::json!({"command": "true"}),
            }],
        }
    }

    #[test]
    fn validate_rejects_empty_pipeline() {
        let def = def_with(vec![]);
        assert!(validate(&def).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_job_names() {
        let def = def_with(vec![job("build", &[]), job("build", &[])]);
        assert!(validate(&def).is_err());
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let def = def_with(vec![job("test", &["build"])]);
        assert!(validate(&def).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_pipeline() {
        let def = def_with(vec![job("build", &[]), job("test", &["build"])]);
        assert!(validate(&def).is_ok());
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let def = def_with(vec![
            job("deploy", &["test"]),
            job("test", &["build"]),
            job("build", &[]),
        ]);
        let ordered = topological_order(&def).unwrap();
        let names: Vec<&str> = ordered.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["build", "test", "deploy"]);
    }

    #[test]
    fn topological_order_rejects_cycle() {
        let def = def_with(vec![job("a", &["b"]), job("b", &["a"])]);
        assert!(topological_order(&def).is_err());
    }
}
