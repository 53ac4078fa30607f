//! `dispatchsim scenarios`: the scenario catalog.

use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, Table};
use dispatchsim_core::ScenarioCatalog;
use dispatchsim_protocol::ScenarioDescriptor;

pub fn run(catalog: &ScenarioCatalog, event_type: Option<&str>) {
    let scenarios: Vec<&ScenarioDescriptor> = match event_type {
        Some(event_type) => catalog.by_event_type(event_type).collect(),
        None => catalog.all().iter().collect(),
    };

    if scenarios.is_empty() {
        println!("  No scenarios match.");
        return;
    }
    println!("{}", scenario_table(&scenarios));
    println!("  Start a call with: dispatchsim call <code> [--subtype <subtype>]");
}

fn scenario_table(scenarios: &[&ScenarioDescriptor]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(
        ["Code", "Event type", "Subtypes", "EPD", "Weapon"]
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan)),
    );
    for scenario in scenarios {
        table.add_row(vec![
            Cell::new(&scenario.code),
            Cell::new(&scenario.event_type),
            Cell::new(scenario.event_subtypes.join(", ")),
            Cell::new(&scenario.epd),
            Cell::new(if scenario.weapon_available { "yes" } else { "" }),
        ]);
    }
    table
}
