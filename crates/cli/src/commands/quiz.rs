//! `mentorlink quiz`: generate a multiple-choice quiz.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

pub async fn run(
    subject: &str,
    level: &str,
    questions: usize,
    html: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let state = mentorlink_gateway::build_state(&config).await?;

    let cancel = CancellationToken::new();
    super::cancel_on_ctrl_c(cancel.clone());

    eprint!("  Generating...");
    let quiz = state.quiz.generate(subject, level, questions, &cancel).await?;
    eprint!("\r                \r");

    if quiz.fallback {
        eprintln!("  ⚠️  The model's quiz was unusable, showing placeholder questions");
    }

    if let Some(path) = html {
        std::fs::write(&path, quiz.to_html())?;
        println!("✅ Quiz written to {}", path.display());
        return Ok(());
    }

    println!("📝 {} quiz ({})", quiz.subject, quiz.level);
    for (n, q) in quiz.questions.iter().enumerate() {
        println!();
        println!("{}. {}", n + 1, q.question);
        for (letter, option) in ('A'..='D').zip(&q.options) {
            println!("   {letter}) {option}");
        }
        println!("   Answer: {}", q.correct_answer);
        println!("   {}", q.explanation);
    }

    Ok(())
}
