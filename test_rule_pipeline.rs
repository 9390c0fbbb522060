use scanmill::config::Config;
use scanmill::pipeline::PipelineRunner;
use scanmill::plugins::build_plugin_set;
use scanmill::prepender::PrependerStage;
use scanmill::statistics::StatisticsCollector;
use scanmill::suspect::{MessageSource, Suspect};
use scanmill::timing::{StageKind, TimingTracker};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // Load the configuration, falling back to the built-in sample
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };
    let stats = Arc::new(StatisticsCollector::in_memory());
    let plugins = build_plugin_set(&config.plugins, stats.clone())?;

    let cases = [
        (
            "newsletter@shop.example",
            "bob@example.net",
            "Subject: Huge discount on everything\r\nFrom: Shop <newsletter@shop.example>\r\nX-Mailer: service.mail.cn\r\n\r\nBuy now!\r\n",
        ),
        (
            "cron@localhost",
            "root@example.net",
            "Subject: Cron output\r\nFrom: cron@localhost\r\nX-Mailer: service.mail.cn\r\n\r\nOutput\r\n",
        ),
        (
            "alice@example.org",
            "bob@example.net",
            "Subject: Lunch?\r\nFrom: Alice <alice@example.org>\r\n\r\nNoon works.\r\n",
        ),
    ];

    for (sender, recipient, message) in cases {
        let mut suspect = Suspect::new(
            sender,
            vec![recipient.to_string()],
            MessageSource::Buffer(message.as_bytes().to_vec()),
        )?;
        let mut timer = TimingTracker::new(true);

        println!("Testing message from {} to {}", sender, recipient);
        println!("Subject: {}", suspect.header("Subject").unwrap_or_default());

        let lists = PrependerStage::new(&plugins.prependers).run(&mut suspect, &plugins, &mut timer);
        println!(
            "Active scanners: {:?}",
            scanmill::plugin::names(&lists.scanners)
        );

        let outcome = PipelineRunner::new(None).run(&lists.scanners, &mut suspect, &mut timer);
        println!("Decision: {}", outcome.action);
        if let Some(decided_by) = &outcome.decided_by {
            println!("Decided by: {}", decided_by);
        }
        if let Some(message) = &outcome.message {
            println!("Message: {}", message);
        }
        println!("Spam: {}", suspect.is_spam());
        println!(
            "Plugin time: {:.6}s",
            timer.total_time(Some(StageKind::Plugin))
        );
        println!();
    }

    Ok(())
}
