//! Reasoning-block stripping.
//!
//! Some models wrap their chain of thought in `<think>...</think>` or
//! `<thinking>...</thinking>`. The visible answer keeps everything else;
//! the blocks are returned separately. Tags inside fenced code blocks are
//! content, not markup, and are left untouched. An unterminated opening tag
//! swallows the rest of the input.

const FENCE: &str = "```";
const TAGS: [(&str, &str); 2] = [("<thinking>", "</thinking>"), ("<think>", "</think>")];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stripped {
    pub visible: String,
    pub thinking: Vec<String>,
}

/// Split `input` into its visible text and its reasoning blocks.
pub fn strip_thinking(input: &str) -> Stripped {
    let mut out = Stripped::default();
    let mut rest = input;
    let mut in_fence = false;

    while !rest.is_empty() {
        if in_fence {
            match rest.find(FENCE) {
                Some(i) => {
                    out.visible.push_str(&rest[..i + FENCE.len()]);
                    rest = &rest[i + FENCE.len()..];
                    in_fence = false;
                }
                None => {
                    out.visible.push_str(rest);
                    break;
                }
            }
            continue;
        }

        let fence = rest.find(FENCE);
        let tag = find_open_tag(rest);
        match (fence, tag) {
            (Some(f), Some((t, _, _))) if f < t => {
                out.visible.push_str(&rest[..f + FENCE.len()]);
                rest = &rest[f + FENCE.len()..];
                in_fence = true;
            }
            (Some(f), None) => {
                out.visible.push_str(&rest[..f + FENCE.len()]);
                rest = &rest[f + FENCE.len()..];
                in_fence = true;
            }
            (_, Some((t, open, close))) => {
                out.visible.push_str(&rest[..t]);
                let body = &rest[t + open.len()..];
                let (block, remainder) = match body.find(close) {
                    Some(c) => (&body[..c], &body[c + close.len()..]),
                    None => (body, ""),
                };
                let block = block.trim();
                if !block.is_empty() {
                    out.thinking.push(block.to_string());
                }
                rest = remainder;
            }
            (None, None) => {
                out.visible.push_str(rest);
                break;
            }
        }
    }
    out
}

/// Earliest opening tag: (position, open tag, close tag).
fn find_open_tag(text: &str) -> Option<(usize, &'static str, &'static str)> {
    TAGS.iter()
        .filter_map(|&(open, close)| text.find(open).map(|i| (i, open, close)))
        .min_by_key(|&(i, _, _)| i)
}
