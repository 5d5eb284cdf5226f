//! `mentorlink ask`: one question through the full pipeline.

use std::io::Write;

use mentorlink_core::SessionId;
use mentorlink_pipeline::{Outcome, QueryEvent, QueryRequest, TutorProfile};
use tokio_util::sync::CancellationToken;

/// Tutoring profile from the command-line flags, if both subject and level were given.
pub fn profile(subject: Option<String>, level: Option<String>, style: Option<String>) -> Option<TutorProfile> {
    let profile = TutorProfile::new(subject?, level?);
    Some(match style {
        Some(style) => profile.with_learning_style(style),
        None => profile,
    })
}

pub async fn run(
    query: String,
    session: Option<String>,
    stream: bool,
    profile: Option<TutorProfile>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set MENTORLINK_API_KEY or OPENAI_API_KEY, or add api_key to:");
        eprintln!("    {}", mentorlink_config::AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let state = mentorlink_gateway::build_state(&config).await?;

    let mut request = QueryRequest::new(query);
    if let Some(id) = session {
        request = request.with_session(SessionId(id));
    }
    if let Some(profile) = profile {
        request = request.with_profile(profile);
    }
    if stream {
        request = request.streaming();
    }

    let cancel = CancellationToken::new();
    super::cancel_on_ctrl_c(cancel.clone());

    match state.orchestrator.handle(request, cancel).await? {
        Outcome::Answer(answer) => {
            println!("{}", answer.answer);
            print_citations(answer.citations.iter().map(|c| c.source.as_str()));
            eprintln!("  session: {}", answer.session_id);
        }
        Outcome::Stream(mut stream) => {
            let mut stdout = std::io::stdout();
            let mut sources = Vec::new();
            while let Some(event) = stream.recv().await {
                match event {
                    QueryEvent::Start { citations, .. } => {
                        sources = citations.into_iter().map(|c| c.source).collect();
                    }
                    QueryEvent::Chunk { content } => {
                        write!(stdout, "{content}")?;
                        stdout.flush()?;
                    }
                    QueryEvent::Done { session_id, .. } => {
                        println!();
                        print_citations(sources.iter().map(String::as_str));
                        eprintln!("  session: {session_id}");
                    }
                    QueryEvent::Error { stage, message, .. } => {
                        println!();
                        return Err(format!("{stage} stage failed: {message}").into());
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_citations<'a>(sources: impl Iterator<Item = &'a str>) {
    let mut sources: Vec<&str> = sources.collect();
    sources.dedup();
    if !sources.is_empty() {
        eprintln!();
        eprintln!("  Sources: {}", sources.join(", "));
    }
}
