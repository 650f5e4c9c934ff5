//! Statistics display and formatting

use sluice_protocol::{CountersSnapshot, PublicationHandle, TermPosition};
use std::io::Write;
use std::time::Duration;

const BINARY_UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

fn scaled(value: f64, units: &[&str]) -> String {
    let mut value = value;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < units.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value as u64, units[0])
    } else {
        format!("{:.2} {}", value, units[unit])
    }
}

/// Byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    scaled(bytes as f64, &BINARY_UNITS)
}

/// Average send rate over `elapsed`, in bytes per second
pub fn format_rate(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
    format!("{}/s", scaled(rate, &BINARY_UNITS))
}

/// Uptime as hh:mm:ss
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// A stream position as its term id and offset
pub fn format_term_position(publication: &PublicationHandle, position: i64) -> String {
    let term_position = TermPosition::new(publication.term_length(), publication.initial_term_id());
    format!(
        "{} (term {} @ {})",
        position,
        term_position.term_id(position),
        term_position.term_offset(position)
    )
}

/// Display the publication's positions and driver counters
pub fn display_counters(publication: &PublicationHandle, counters: &CountersSnapshot, elapsed: Duration) {
    let sent = publication.consumer_position().max(0) as u64;
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ PUBLICATION {}:{}", publication.session_id(), publication.stream_id());
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Uptime:            {}", format_duration(elapsed));
    println!(
        "│ Producer position: {}",
        format_term_position(publication, publication.producer_position())
    );
    println!(
        "│ Sender position:   {}",
        format_term_position(publication, publication.consumer_position())
    );
    println!("│ Sent:              {} at {}", format_bytes(sent), format_rate(sent, elapsed));
    println!("│ Publisher limit:   {}", publication.publisher_limit().get_volatile());
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Heartbeats sent:          {}", counters.heartbeats_sent);
    println!("│ Retransmits sent:         {}", counters.retransmits_sent);
    println!("│ Flow control limits:      {}", counters.sender_flow_control_limits);
    println!("│ Data short sends:         {}", counters.data_packet_short_sends);
    println!("│ Setup short sends:        {}", counters.setup_message_short_sends);
    println!("│ Status messages received: {}", counters.status_messages_received);
    println!("│ NAKs received:            {}", counters.naks_received);
    println!("│ NAKs dropped:             {}", counters.naks_dropped);
    println!("└─────────────────────────────────────────────────────────────┘");
}

/// Display compact stats on one line (for continuous updates)
pub fn display_compact_stats(publication: &PublicationHandle, counters: &CountersSnapshot, elapsed: Duration) {
    let sent = publication.consumer_position().max(0) as u64;
    let backlog = (publication.producer_position() - publication.consumer_position()).max(0) as u64;

    eprint!(
        "\r[{}] Sent: {} | Rate: {} | Backlog: {} | Retransmits: {} | NAKs: {}         ",
        format_duration(elapsed),
        format_bytes(sent),
        format_rate(sent, elapsed),
        format_bytes(backlog),
        counters.retransmits_sent,
        counters.naks_received
    );
    let _ = std::io::stderr().flush();
}
