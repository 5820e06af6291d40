//! Markdown to Org rewriting for model responses.
//!
//! Covers the subset completions actually produce: fenced code blocks,
//! inline code, strong and plain emphasis. It is a single left-to-right scan
//! with local lookahead, not a document parser. Delimiters that do not pair
//! up are copied through unchanged.

const FENCE: &str = "```";
const CLOSING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')'];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkupOptions {
    /// Rewrite ATX headings (`## Title`) to Org headings (`** Title`).
    pub convert_headings: bool,
}

/// Converts `input` with default options.
pub fn convert(input: &str) -> String {
    convert_with(input, MarkupOptions::default())
}

pub fn convert_with(input: &str, options: MarkupOptions) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_block = false;
    // Positions of emphasis closers still ahead of the scan, innermost last.
    let mut closers: Vec<usize> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let line_start = i == 0 || chars[i - 1] == '\n';

        if line_start && let Some(fence_at) = fence_start(&chars, i) {
            let line_end = line_end(&chars, i);
            if in_block {
                out.extend(&chars[i..fence_at]);
                out.push_str("#+end_src");
                in_block = false;
                i = line_end;
                continue;
            }
            if has_closing_fence(&chars, line_end) {
                let lang: String = chars[fence_at + FENCE.len()..line_end].iter().collect();
                out.extend(&chars[i..fence_at]);
                out.push_str("#+begin_src");
                if !lang.trim().is_empty() {
                    out.push(' ');
                    out.push_str(lang.trim());
                }
                in_block = true;
                i = line_end;
                continue;
            }
        }

        if in_block {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        if closers.last() == Some(&i) {
            closers.pop();
            out.push('/');
            i += 1;
            continue;
        }

        if line_start && options.convert_headings && let Some(level) = heading_level(&chars, i) {
            out.extend(std::iter::repeat_n('*', level));
            i += level;
            continue;
        }

        while closers.last().is_some_and(|&close| close < i) {
            closers.pop();
        }
        let limit = closers
            .last()
            .copied()
            .unwrap_or_else(|| line_end(&chars, i));

        match chars[i] {
            '`' => {
                if let Some(close) = find_before(&chars, i + 1, limit, '`')
                    && close > i + 1
                {
                    out.push('=');
                    out.extend(&chars[i + 1..close]);
                    out.push('=');
                    i = close + 1;
                } else {
                    out.push('`');
                    i += 1;
                }
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                out.push('*');
                // The second star may close an open emphasis.
                i += if closers.last() == Some(&(i + 1)) { 1 } else { 2 };
            }
            delim @ ('*' | '_') => {
                if let Some(close) = emphasis_close(&chars, i, limit, delim) {
                    closers.push(close);
                    out.push('/');
                } else {
                    out.push(delim);
                }
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Index of the fence after optional indentation on the line starting at `i`.
fn fence_start(chars: &[char], i: usize) -> Option<usize> {
    let mut j = i;
    while j < chars.len() && (chars[j] == ' ' || chars[j] == '\t') {
        j += 1;
    }
    starts_with(chars, j, FENCE).then_some(j)
}

fn has_closing_fence(chars: &[char], from: usize) -> bool {
    let mut i = from;
    while i < chars.len() {
        if chars[i] == '\n' && fence_start(chars, i + 1).is_some() {
            return true;
        }
        i += 1;
    }
    false
}

fn starts_with(chars: &[char], i: usize, pattern: &str) -> bool {
    let mut idx = i;
    for p in pattern.chars() {
        if chars.get(idx) != Some(&p) {
            return false;
        }
        idx += 1;
    }
    true
}

fn line_end(chars: &[char], i: usize) -> usize {
    chars[i..]
        .iter()
        .position(|&c| c == '\n')
        .map_or(chars.len(), |p| i + p)
}

fn find_before(chars: &[char], from: usize, limit: usize, target: char) -> Option<usize> {
    (from..limit.min(chars.len())).find(|&j| chars[j] == target)
}

fn heading_level(chars: &[char], i: usize) -> Option<usize> {
    let level = chars[i..].iter().take_while(|&&c| c == '#').count();
    (level > 0 && chars.get(i + level) == Some(&' ')).then_some(level)
}

/// Finds the closer for a single-character emphasis opened at `i`.
///
/// The opener must follow whitespace (or start the text) and precede a
/// non-space; the closer must follow a non-space and precede whitespace,
/// closing punctuation, or the end of the text.
fn emphasis_close(chars: &[char], i: usize, limit: usize, delim: char) -> Option<usize> {
    let opens = (i == 0 || chars[i - 1].is_whitespace())
        && chars
            .get(i + 1)
            .is_some_and(|&c| !c.is_whitespace() && c != delim);
    if !opens {
        return None;
    }
    (i + 2..limit.min(chars.len())).find(|&j| {
        chars[j] == delim
            && !chars[j - 1].is_whitespace()
            && chars
                .get(j + 1)
                .is_none_or(|&c| c.is_whitespace() || CLOSING_PUNCTUATION.contains(&c))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_unchanged() {
        let input = "No markup here.\n\nJust (plain) text, 1 + 2 = 3 # not a heading";
        assert_eq!(convert(input), input);
    }

    #[test]
    fn inline_code_becomes_verbatim() {
        assert_eq!(convert("`code`"), "=code=");
        assert_eq!(convert("run `cargo test` now"), "run =cargo test= now");
    }

    #[test]
    fn fenced_block_becomes_src_block() {
        let out = convert("```python\nx=1\n```");
        assert_eq!(out, "#+begin_src python\nx=1\n#+end_src");
    }

    #[test]
    fn fenced_block_without_language() {
        assert_eq!(convert("```\nls -la\n```\n"), "#+begin_src\nls -la\n#+end_src\n");
    }

    #[test]
    fn fence_contents_are_verbatim() {
        let out = convert("```rust\nlet _x_ = **y**;\n```");
        assert_eq!(out, "#+begin_src rust\nlet _x_ = **y**;\n#+end_src");
    }

    #[test]
    fn unclosed_fence_is_left_alone() {
        assert_eq!(convert("```python\nx = 1"), "```python\nx = 1");
    }

    #[test]
    fn indented_fence_keeps_indentation() {
        let out = convert("1. step\n   ```sh\n   make\n   ```");
        assert_eq!(out, "1. step\n   #+begin_src sh\n   make\n   #+end_src");
    }

    #[test]
    fn strong_emphasis_loses_one_asterisk_per_side() {
        assert_eq!(convert("**bold**"), "*bold*");
        assert_eq!(convert("a **strong** claim"), "a *strong* claim");
    }

    #[test]
    fn underscore_emphasis_becomes_slashes() {
        assert_eq!(convert("plain _italic_ text"), "plain /italic/ text");
    }

    #[test]
    fn asterisk_emphasis_becomes_slashes() {
        assert_eq!(convert("an *important* point."), "an /important/ point.");
    }

    #[test]
    fn emphasis_before_punctuation() {
        assert_eq!(convert("really _this_, then"), "really /this/, then");
    }

    #[test]
    fn identifiers_with_underscores_are_untouched() {
        let input = "call snake_case_name or my_var_";
        assert_eq!(convert(input), input);
    }

    #[test]
    fn unmatched_delimiters_are_left_as_is() {
        assert_eq!(convert("a `dangling tick"), "a `dangling tick");
        assert_eq!(convert("half _open text"), "half _open text");
        assert_eq!(convert("* bullet item"), "* bullet item");
    }

    #[test]
    fn emphasis_does_not_cross_lines() {
        assert_eq!(convert("_start\nend_"), "_start\nend_");
    }

    #[test]
    fn nested_code_inside_emphasis() {
        assert_eq!(convert("_see `x` here_"), "/see =x= here/");
    }

    #[test]
    fn emphasis_closed_by_a_double_star() {
        assert_eq!(convert("*a** then _x_ and `y`"), "/a*/ then /x/ and =y=");
        assert_eq!(convert("*b**\nnext `line`"), "/b*/\nnext =line=");
    }

    #[test]
    fn headings_convert_only_when_requested() {
        let input = "## Setup\ntext";
        assert_eq!(convert(input), input);
        let options = MarkupOptions {
            convert_headings: true,
        };
        assert_eq!(convert_with(input, options), "** Setup\ntext");
    }
}
