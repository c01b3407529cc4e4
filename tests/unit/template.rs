use blast_engine::template::{render, NAME_PLACEHOLDER};

#[test]
fn test_placeholder_token() {
    assert_eq!(NAME_PLACEHOLDER, "{{nama}}");
}

#[test]
fn test_render_plain_template() {
    assert_eq!(render("Welcome aboard!", "Ana"), "Welcome aboard!");
}

#[test]
fn test_render_substitutes_name() {
    assert_eq!(
        render("Hi {{nama}}, your order shipped.", "Ana"),
        "Hi Ana, your order shipped."
    );
}

#[test]
fn test_render_substitutes_every_occurrence() {
    assert_eq!(
        render("{{nama}}, this one is for {{nama}} only.", "Budi"),
        "Budi, this one is for Budi only."
    );
}

#[test]
fn test_render_strips_markup_tags() {
    assert_eq!(
        render("Hi {{nama}}, <b>50% off</b> until <i>Friday</i>!", "Ana"),
        "Hi Ana, 50% off until Friday!"
    );
}

#[test]
fn test_render_strips_markup_spanning_attributes() {
    assert_eq!(
        render("<a href=\"https://example.com\">tap here</a>", "Ana"),
        "tap here"
    );
}

#[test]
fn test_unclosed_angle_bracket_kept_literal() {
    assert_eq!(render("price < 100", "Ana"), "price < 100");
    assert_eq!(render("broken <tag", "Ana"), "broken <tag");
}

#[test]
fn test_markup_in_name_does_not_survive() {
    assert_eq!(render("Hi {{nama}}!", "<b>Ana</b>"), "Hi Ana!");
}

#[test]
fn test_render_empty_name() {
    assert_eq!(render("Hi {{nama}}!", ""), "Hi !");
}

#[test]
fn test_render_adjacent_tags() {
    assert_eq!(render("<b><i>deal</i></b> {{nama}}", "Citra"), "deal Citra");
}
