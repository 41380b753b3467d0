use crate::migration::Migration;
use tabled::Tabled;

pub fn format_steps_table<'a>(
    steps: impl Iterator<Item = &'a dyn Migration>,
    current: Option<u32>,
) -> String {
    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "Step")]
        step: String,
        #[tabled(rename = "From")]
        from: u32,
        #[tabled(rename = "To")]
        to: u32,
        #[tabled(rename = "Reversible")]
        reversible: &'static str,
        #[tabled(rename = "Description")]
        description: &'static str,
    }

    let rows: Vec<Row> = steps
        .map(|step| Row {
            step: mark_current(step, current),
            from: step.from_version(),
            to: step.to_version(),
            reversible: if step.reversible() { "yes" } else { "no" },
            description: step.description(),
        })
        .collect();

    if rows.is_empty() {
        return "(no migration steps)".to_string();
    }

    tabled::Table::new(rows).to_string()
}

/// Flags the step that would run next for a repo at `current`.
fn mark_current(step: &dyn Migration, current: Option<u32>) -> String {
    if current == Some(step.from_version()) {
        format!("{} *", step.versions())
    } else {
        step.versions()
    }
}
