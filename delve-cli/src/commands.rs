//! CLI subcommand handlers.

use crate::progress::ProgressPrinter;
use crate::{Commands, ConfigAction};
use anyhow::{Context, anyhow};
use delve_core::config::{DelveConfig, StoreBackend, StoreConfig, load_config};
use delve_core::research::session::{
    QueryMode, ResearchOptions, ResearchSession, SessionSummary,
};
use delve_core::{
    FileStateStore, InMemoryStateStore, ResearchOrchestrator, ResearchOutcome, StateStore,
    create_generator,
};
use delve_tools::{HttpContentFetcher, build_engines};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path, quiet: bool) -> anyhow::Result<()> {
    let config = load_config(Some(workspace), None)
        .map_err(|e| anyhow!("Configuration error: {}", e))?;
    if !quiet {
        for warning in config.validate() {
            eprintln!("warning: {warning}");
        }
    }

    match command {
        Commands::Run {
            query,
            mode,
            max_depth,
            max_sources,
            focus,
            output,
            json,
        } => {
            let options = research_options(mode.as_deref(), max_depth, max_sources, focus)?;
            let orchestrator = build_orchestrator(&config, quiet)?;
            let outcome = orchestrator.start(&query, options).await?;
            emit_outcome(&outcome, output.as_deref(), json)
        }
        Commands::Resume {
            session_id,
            clarification,
            output,
            json,
        } => {
            let id = parse_session_id(&session_id)?;
            let orchestrator = build_orchestrator(&config, quiet)?;
            let outcome = orchestrator.resume(id, &clarification).await?;
            emit_outcome(&outcome, output.as_deref(), json)
        }
        Commands::Status { session_id, json } => {
            let id = parse_session_id(&session_id)?;
            let store = build_store(&config.store);
            let session = store
                .load(id)
                .await?
                .ok_or_else(|| anyhow!("No session with id {id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                println!("{}", render_status(&session));
            }
            Ok(())
        }
        Commands::Sessions => {
            let store = build_store(&config.store);
            println!("{}", render_sessions(&store.list().await?));
            Ok(())
        }
        Commands::Config { action } => handle_config(action, &config),
    }
}

fn handle_config(action: ConfigAction, config: &DelveConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn parse_session_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("'{raw}' is not a valid session id"))
}

fn research_options(
    mode: Option<&str>,
    max_depth: Option<u32>,
    max_sources: Option<usize>,
    focus_areas: Vec<String>,
) -> anyhow::Result<ResearchOptions> {
    let mode = mode
        .map(|m| m.parse::<QueryMode>())
        .transpose()
        .map_err(|e| anyhow!(e))?;
    Ok(ResearchOptions {
        mode,
        max_depth,
        max_sources,
        focus_areas,
    })
}

fn build_store(config: &StoreConfig) -> Arc<dyn StateStore> {
    match config.backend {
        StoreBackend::Memory => Arc::new(InMemoryStateStore::new()),
        StoreBackend::File => Arc::new(FileStateStore::new(config.resolved_path())),
    }
}

fn build_orchestrator(config: &DelveConfig, quiet: bool) -> anyhow::Result<ResearchOrchestrator> {
    let generator = create_generator(&config.llm)?;
    let engines = build_engines(
        &config.engines,
        Duration::from_secs(config.research.engine_timeout_secs),
    );
    if !quiet {
        for err in &engines.unavailable {
            eprintln!("warning: {err}");
        }
    }
    let fetcher = Arc::new(HttpContentFetcher::new()?);
    Ok(ResearchOrchestrator::new(
        config.research.clone(),
        generator,
        engines.engines,
        fetcher,
        build_store(&config.store),
    )
    .with_callback(Arc::new(ProgressPrinter::new(quiet))))
}

fn emit_outcome(outcome: &ResearchOutcome, output: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let rendered = if json {
        serde_json::to_string_pretty(outcome)?
    } else {
        render_outcome(outcome)
    };
    match output {
        Some(path) => {
            write_output(path, &rendered)?;
            eprintln!("Report written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    if outcome.error.is_some() {
        return Err(anyhow!(
            "research session {} failed; see the report for details",
            outcome.session_id
        ));
    }
    Ok(())
}

fn write_output(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Human-readable rendering of an outcome.
pub fn render_outcome(outcome: &ResearchOutcome) -> String {
    let id = outcome.session_id;
    if let Some(question) = &outcome.clarification_question {
        return format!(
            "Clarification needed: {question}\n\nContinue with:\n  delve resume {id} \"<your answer>\""
        );
    }

    let mut out = outcome.report.clone().unwrap_or_default();
    let meta = &outcome.metadata;
    out.push_str(&format!(
        "\n\n---\nSession {id} | {} | {} sub-questions | {} sources | {} contradictions",
        meta.phase, meta.sub_question_count, meta.total_sources, meta.contradiction_count
    ));
    if !meta.errors.is_empty() || !meta.fetch_errors.is_empty() {
        out.push_str(&format!(
            "\n{} engine errors, {} fetch errors (see `delve status {id} --json`)",
            meta.errors.len(),
            meta.fetch_errors.len()
        ));
    }
    out
}

pub fn render_status(session: &ResearchSession) -> String {
    let mut lines = vec![
        format!("Session:   {}", session.id),
        format!("Query:     {}", session.query),
        format!(
            "Phase:     {} ({:.0}%)",
            session.phase.as_str(),
            session.progress * 100.0
        ),
        format!("Mode:      {}", session.mode),
        format!("Updated:   {}", session.updated_at.format("%Y-%m-%d %H:%M:%S UTC")),
    ];
    if let Some(question) = &session.clarification_question {
        if !session.complete {
            lines.push(format!("Question:  {question}"));
        }
    }
    if let Some(plan) = &session.plan {
        lines.push(format!("Plan:      {} sub-questions", plan.len()));
    }
    lines.push(format!("Sources:   {} ranked", session.ranked_sources.len()));
    if !session.errors.is_empty() {
        lines.push(format!("Errors:    {}", session.errors.len()));
    }
    if let Some(err) = &session.error {
        lines.push(format!("Failed:    {err}"));
    }
    lines.join("\n")
}

pub fn render_sessions(summaries: &[SessionSummary]) -> String {
    if summaries.is_empty() {
        return "No research sessions found.".to_string();
    }
    let mut out = format!("Research sessions ({}):", summaries.len());
    for s in summaries {
        let query: String = s.query.chars().take(60).collect();
        out.push_str(&format!(
            "\n  {}  {:<20} {:>3.0}%  {}  {}",
            s.id,
            s.phase.as_str(),
            s.progress * 100.0,
            s.updated_at.format("%Y-%m-%d %H:%M"),
            query
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_core::ResearchConfig;
    use delve_core::research::session::ResearchPhase;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn outcome(session: &ResearchSession) -> ResearchOutcome {
        ResearchOutcome::from_session(session)
    }

    #[test]
    fn test_research_options() {
        let options = research_options(Some("depth"), Some(2), None, vec!["cost".into()]).unwrap();
        assert_eq!(options.mode, Some(QueryMode::DepthFirst));
        assert_eq!(options.max_depth, Some(2));
        assert_eq!(options.focus_areas, vec!["cost".to_string()]);

        let err = research_options(Some("sideways"), None, None, vec![]).unwrap_err();
        assert!(err.to_string().contains("unknown query mode"));
    }

    #[test]
    fn test_parse_session_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_session_id(&format!(" {id} ")).unwrap(), id);
        assert!(parse_session_id("not-a-uuid").is_err());
    }

    #[test]
    fn test_render_clarification() {
        let mut session = ResearchSession::new("jaguar speed", ResearchOptions::default(), &ResearchConfig::default());
        session.clarification_question = Some("The animal or the car?".into());
        session.transition(ResearchPhase::ClarificationNeeded).unwrap();

        let text = render_outcome(&outcome(&session));
        assert!(text.starts_with("Clarification needed: The animal or the car?"));
        assert!(text.contains(&format!("delve resume {}", session.id)));
    }

    #[test]
    fn test_render_failed_outcome() {
        let mut session = ResearchSession::new("q", ResearchOptions::default(), &ResearchConfig::default());
        session.fail("disk full");
        let text = render_outcome(&outcome(&session));
        assert!(text.starts_with("Research encountered an error: disk full"));
        assert!(text.contains("| error |"));
    }

    #[test]
    fn test_render_status() {
        let session = ResearchSession::new(
            "grid storage",
            ResearchOptions::default(),
            &ResearchConfig::default(),
        );
        let text = render_status(&session);
        assert!(text.contains("Query:     grid storage"));
        assert!(text.contains("Phase:     intake ("));
        assert!(text.contains("Sources:   0 ranked"));
    }

    #[tokio::test]
    async fn test_file_store_sessions_listing() {
        let dir = TempDir::new().unwrap();
        let store = build_store(&StoreConfig {
            backend: StoreBackend::File,
            path: Some(dir.path().to_path_buf()),
        });
        assert_eq!(render_sessions(&store.list().await.unwrap()), "No research sessions found.");

        let session = ResearchSession::new(
            "sodium ion batteries",
            ResearchOptions::default(),
            &ResearchConfig::default(),
        );
        store.save(&session).await.unwrap();

        let listing = render_sessions(&store.list().await.unwrap());
        assert!(listing.starts_with("Research sessions (1):"));
        assert!(listing.contains(&session.id.to_string()));
        assert!(listing.contains("sodium ion batteries"));
    }

    #[test]
    fn test_write_output_creates_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("out.md");
        write_output(&path, "# Report").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "# Report");
    }
}
