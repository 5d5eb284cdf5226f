//! `mentorlink sessions`: inspect the session store.
//!
//! Only meaningful with `session.backend = "sqlite"`; the in-memory store
//! starts empty for every process.

use mentorlink_core::SessionId;

pub async fn list() -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let state = mentorlink_gateway::build_state(&config).await?;
    let sessions = state.orchestrator.store().list().await?;

    if sessions.is_empty() {
        println!("No sessions stored ({} backend).", config.session.backend);
        return Ok(());
    }

    println!("{:<38} {:>6}  {}", "SESSION", "TURNS", "UPDATED");
    for s in &sessions {
        println!(
            "{:<38} {:>6}  {}",
            s.id,
            s.turn_count,
            s.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn show(id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let state = mentorlink_gateway::build_state(&config).await?;
    let conversation = match state.orchestrator.store().find(&SessionId::from(id)).await? {
        Some(conversation) if !conversation.turns.is_empty() => conversation,
        _ => return Err(format!("Session '{id}' not found").into()),
    };
    for turn in &conversation.turns {
        println!("[{}] {}", turn.role.as_str(), turn.content);
        if !turn.citations.is_empty() {
            println!("    cited: {}", turn.citations.join(", "));
        }
    }
    Ok(())
}

pub async fn delete(id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let state = mentorlink_gateway::build_state(&config).await?;
    let store = state.orchestrator.store();
    let session_id = SessionId::from(id);

    let _lease = store.lock(&session_id).await;
    if store.delete(&session_id).await? {
        println!("✅ Deleted session {id}");
        Ok(())
    } else {
        Err(format!("Session '{id}' not found").into())
    }
}
