/// Placeholder token substituted with the recipient's name.
pub const NAME_PLACEHOLDER: &str = "{{nama}}";

/// Renders a campaign template for one recipient: every `{{nama}}` becomes
/// the recipient name, then markup tags are stripped. Substitution runs
/// first, so markup inside a name does not survive either.
pub fn render(template: &str, name: &str) -> String {
    let substituted = template.replace(NAME_PLACEHOLDER, name);
    strip_markup(&substituted)
}

/// Removes `<...>` runs. A `<` with no closing `>` is kept literally.
fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        match rest[open + 1..].find('>') {
            Some(close) => {
                rest = &rest[open + 1 + close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
