//! UI element types for the native automation surface.
//!
//! The device reports its UI as a `uiautomator` XML dump. This module parses
//! that dump into a [`UiNode`] tree, searches it with the supported locator
//! strategies, and caches found elements behind opaque ids so later commands
//! (`getText`, gestures targeting an element) can refer to them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DriverError;

/// Position and size of an element in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Width.
    pub width: f64,
    /// Height.
    pub height: f64,
}

impl Rect {
    /// Parses uiautomator bounds of the form `[x1,y1][x2,y2]`.
    pub fn from_bounds(bounds: &str) -> Option<Self> {
        let nums: Vec<f64> = bounds
            .split(|c| c == '[' || c == ']' || c == ',')
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        if nums.len() != 4 {
            return None;
        }
        Some(Self {
            x: nums[0],
            y: nums[1],
            width: nums[2] - nums[0],
            height: nums[3] - nums[1],
        })
    }

    /// Center point of the rectangle.
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One node of the UI hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiNode {
    /// Widget class (e.g. `android.widget.TextView`).
    #[serde(default)]
    pub class_name: Option<String>,
    /// Fully-qualified resource id (`pkg:id/name`).
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Visible text.
    #[serde(default)]
    pub text: Option<String>,
    /// Accessibility description.
    #[serde(default)]
    pub content_desc: Option<String>,
    /// Owning package.
    #[serde(default)]
    pub package: Option<String>,
    /// Screen bounds.
    #[serde(default)]
    pub bounds: Option<Rect>,
    /// Nested nodes.
    #[serde(default)]
    pub children: Vec<UiNode>,
}

/// Supported element lookup strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorStrategy {
    /// Resource id; short ids are qualified with the app package.
    Id,
    /// Content description.
    AccessibilityId,
    /// Widget class.
    ClassName,
    /// Exact visible text.
    Text,
}

impl LocatorStrategy {
    /// Parses a wire strategy name.
    pub fn parse(name: &str) -> Result<Self, DriverError> {
        match name {
            "id" => Ok(Self::Id),
            "accessibility id" => Ok(Self::AccessibilityId),
            "class name" => Ok(Self::ClassName),
            "text" => Ok(Self::Text),
            other => Err(DriverError::InvalidSelector(format!(
                "locator strategy '{}' is not supported",
                other
            ))),
        }
    }
}

/// Parses a `uiautomator` dump into its top-level nodes.
pub fn parse_hierarchy(xml: &str) -> Result<Vec<UiNode>, DriverError> {
    let malformed = |what: &str| DriverError::InvalidArgument(format!("malformed hierarchy: {}", what));

    // stack[0] collects the roots; each open <node> pushes a level.
    let mut stack: Vec<(UiNode, Vec<UiNode>)> = vec![(UiNode::default(), Vec::new())];
    let mut rest = xml;

    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];
        let close = rest.find('>').ok_or_else(|| malformed("unterminated tag"))?;
        let tag = &rest[..close];
        rest = &rest[close + 1..];

        if tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }
        if let Some(name) = tag.strip_prefix('/') {
            if name.trim() == "node" {
                let (mut node, children) = stack.pop().ok_or_else(|| malformed("unbalanced </node>"))?;
                node.children = children;
                stack
                    .last_mut()
                    .ok_or_else(|| malformed("unbalanced </node>"))?
                    .1
                    .push(node);
            }
            continue;
        }

        let self_closing = tag.ends_with('/');
        let tag = tag.trim_end_matches('/');
        let (name, attrs) = tag.split_once(char::is_whitespace).unwrap_or((tag, ""));
        if name != "node" {
            continue;
        }
        let node = node_from_attrs(&parse_attrs(attrs));
        if self_closing {
            stack
                .last_mut()
                .ok_or_else(|| malformed("node outside hierarchy"))?
                .1
                .push(node);
        } else {
            stack.push((node, Vec::new()));
        }
    }

    if stack.len() != 1 {
        return Err(malformed("unclosed <node>"));
    }
    Ok(stack.pop().map(|(_, roots)| roots).unwrap_or_default())
}

fn parse_attrs(raw: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = raw;
    while let Some(eq) = rest.find('=') {
        let name = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].trim_start();
        let Some(quote) = after.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            break;
        };
        let body = &after[1..];
        let Some(end) = body.find(quote) else {
            break;
        };
        attrs.insert(name, unescape(&body[..end]));
        rest = &body[end + 1..];
    }
    attrs
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}

fn node_from_attrs(attrs: &HashMap<String, String>) -> UiNode {
    let non_empty = |key: &str| attrs.get(key).filter(|v| !v.is_empty()).cloned();
    UiNode {
        class_name: non_empty("class"),
        resource_id: non_empty("resource-id"),
        text: non_empty("text"),
        content_desc: non_empty("content-desc"),
        package: non_empty("package"),
        bounds: attrs.get("bounds").and_then(|b| Rect::from_bounds(b)),
        children: Vec::new(),
    }
}

fn matches(node: &UiNode, strategy: LocatorStrategy, selector: &str, app_package: Option<&str>) -> bool {
    match strategy {
        LocatorStrategy::Id => node.resource_id.as_deref().map_or(false, |id| {
            id == selector
                || (!selector.contains(':')
                    && app_package.map_or(false, |pkg| id == format!("{}:id/{}", pkg, selector)))
        }),
        LocatorStrategy::AccessibilityId => node.content_desc.as_deref() == Some(selector),
        LocatorStrategy::ClassName => node.class_name.as_deref() == Some(selector),
        LocatorStrategy::Text => node.text.as_deref() == Some(selector),
    }
}

/// Collects every node matching the locator, in document order.
pub fn find_all(
    nodes: &[UiNode],
    strategy: LocatorStrategy,
    selector: &str,
    app_package: Option<&str>,
) -> Vec<UiNode> {
    let mut found = Vec::new();
    collect_matches(nodes, strategy, selector, app_package, &mut found);
    found
}

fn collect_matches(
    nodes: &[UiNode],
    strategy: LocatorStrategy,
    selector: &str,
    app_package: Option<&str>,
    found: &mut Vec<UiNode>,
) {
    for node in nodes {
        if matches(node, strategy, selector, app_package) {
            found.push(node.clone());
        }
        collect_matches(&node.children, strategy, selector, app_package, found);
    }
}

/// Elements found during a session, keyed by opaque id.
#[derive(Debug, Default)]
pub struct ElementCache {
    elements: HashMap<String, UiNode>,
}

impl ElementCache {
    /// Stores a node and returns its new id.
    pub fn insert(&mut self, node: UiNode) -> String {
        let id = Uuid::new_v4().to_string();
        self.elements.insert(id.clone(), node);
        id
    }

    /// Looks up a cached node.
    pub fn get(&self, id: &str) -> Result<&UiNode, DriverError> {
        self.elements
            .get(id)
            .ok_or_else(|| DriverError::NoSuchElement(format!("element '{}' is not known", id)))
    }

    /// Bounds of a cached element.
    pub fn rect(&self, id: &str) -> Result<Rect, DriverError> {
        self.get(id)?.bounds.ok_or_else(|| {
            DriverError::NoSuchElement(format!("element '{}' has no on-screen bounds", id))
        })
    }

    /// Forgets every cached element.
    pub fn clear(&mut self) {
        self.elements.clear();
    }

    /// Number of cached elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
