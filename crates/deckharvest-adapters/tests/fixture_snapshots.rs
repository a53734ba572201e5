use std::path::{Path, PathBuf};

use deckharvest_adapters::{archidekt, discovery, moxfield};
use deckharvest_core::{Zone, COMMANDER_CARD_RANGE};
use serde_json::Value as JsonValue;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn read(rel: &str) -> String {
    std::fs::read_to_string(fixtures().join(rel)).unwrap_or_else(|e| panic!("fixture {rel}: {e}"))
}

fn read_json(rel: &str) -> JsonValue {
    serde_json::from_str(&read(rel)).unwrap()
}

#[test]
fn detail_fixtures_are_legal_commander_decks() {
    let archidekt = archidekt::normalize_deck(&read_json("archidekt/deck_detail.json")).unwrap();
    let moxfield =
        moxfield::normalize_deck(&read_json("moxfield/deck.json"), "mXkT3qQ9zE2b").unwrap();

    for deck in [&archidekt, &moxfield] {
        assert!(COMMANDER_CARD_RANGE.contains(&deck.total_quantity()), "{}", deck.title);
        assert_eq!(deck.commanders().len(), 1, "{}", deck.title);
        assert_eq!(deck.zone_quantity(Zone::Command), 1);
    }
}

#[test]
fn rendered_page_and_api_payload_share_one_normalization() {
    let state = moxfield::extract_initial_state(&read("moxfield/rendered_deck.html")).unwrap();
    let deck = moxfield::normalize_deck(&state["deck"]["deck"], "AbCdEf123").unwrap();

    assert_eq!(deck.cards.len(), 3);
    assert_eq!(deck.cards.last().unwrap().zone, Zone::Command);
    assert_eq!(deck.extra["moxfield_id"], "AbCdEf123");
}

#[test]
fn listing_fixtures_yield_deck_ids() {
    let ids = discovery::extract_deck_ids(&read("archidekt/search_page.html"));
    assert_eq!(
        ids.into_iter().collect::<Vec<_>>(),
        vec!["1234567", "2345678", "3456789"]
    );

    let slugs = moxfield::extract_browse_deck_ids(&read("moxfield/browse.html"));
    assert_eq!(slugs, vec!["AbCdEf123", "zz_top-77"]);
}
