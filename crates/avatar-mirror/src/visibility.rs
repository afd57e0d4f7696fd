//! Viewport gating for ensure calls.
//!
//! Visibility is tested against the nearest scrollable ancestor of the
//! element rather than the root viewport, because virtualized lists scroll
//! inside their own container.

use avatar_protocol::EntityKey;

use crate::mirror::AvatarMirror;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    fn right(&self) -> f64 {
        self.x + self.width
    }

    fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Grow by `margin` on every side
    pub fn expand(&self, margin: f64) -> Rect {
        Rect {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + 2.0 * margin,
            height: self.height + 2.0 * margin,
        }
    }

    /// Edge contact counts as intersecting
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x <= other.right()
            && other.x <= self.right()
            && self.y <= other.bottom()
            && other.y <= self.bottom()
    }
}

/// One node of a flattened layout tree, in viewport coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLayout {
    pub rect: Rect,
    pub scrollable: bool,
    pub parent: Option<usize>,
}

/// Index of the nearest scrollable node at or above `element`
pub fn find_scroll_root(nodes: &[NodeLayout], element: usize) -> Option<usize> {
    let mut current = Some(element);
    // bounded walk so a malformed parent cycle cannot spin
    for _ in 0..nodes.len() {
        let index = current?;
        let node = nodes.get(index)?;
        if node.scrollable {
            return Some(index);
        }
        current = node.parent;
    }
    None
}

/// Whether `element` intersects its scroll root grown by `margin`. Elements
/// without a scrollable ancestor are tested against `viewport`.
pub fn is_visible(nodes: &[NodeLayout], element: usize, viewport: Rect, margin: f64) -> bool {
    let Some(node) = nodes.get(element) else {
        return false;
    };
    let root = node
        .parent
        .and_then(|parent| find_scroll_root(nodes, parent))
        .and_then(|index| nodes.get(index))
        .map(|root| root.rect)
        .unwrap_or(viewport);

    node.rect.intersects(&root.expand(margin))
}

impl AvatarMirror {
    /// Run [`ensure`](AvatarMirror::ensure) only when the element is inside
    /// its scroll root. Returns whether ensure ran.
    pub async fn ensure_when_visible(
        &self,
        key: &EntityKey,
        expected_version: Option<&str>,
        nodes: &[NodeLayout],
        element: usize,
        viewport: Rect,
    ) -> bool {
        if !is_visible(nodes, element, viewport, self.config().root_margin) {
            return false;
        }
        self.ensure(key, expected_version).await;
        true
    }
}
