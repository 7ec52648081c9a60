/// Property is a bounded integer cell, `bottom <= value <= top`.
/// Mutations saturate at the bounds and set a changed flag which the
/// outgoing change-message builder consumes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Property {
    pub value: i64,
    pub bottom: i64,
    pub top: i64,
    #[serde(skip)]
    changed: bool,
}

impl Property {
    pub fn new(value: i64, bottom: i64, top: i64) -> Self {
        Self {
            value: value.clamp(bottom, top),
            bottom,
            top,
            changed: false,
        }
    }

    /// Set the value, rounding half away from zero, saturating at the bounds.
    pub fn set(&mut self, v: f64) {
        self.update((v.round() as i64).clamp(self.bottom, self.top));
    }

    /// Increment by `floor(delta)`, saturating at `top`.
    /// Returns the delta actually applied.
    pub fn inc(&mut self, delta: f64) -> i64 {
        let applied = (delta.floor() as i64).min(self.top - self.value);
        self.update(self.value + applied);
        applied
    }

    /// Decrement by `floor(delta)`, saturating at `bottom`.
    /// Returns the (negative) delta actually applied.
    pub fn dec(&mut self, delta: f64) -> i64 {
        let applied = (delta.floor() as i64).min(self.value - self.bottom);
        self.update(self.value - applied);
        -applied
    }

    /// Multiply by `factor`, rounding the product, then clamp to the bounds.
    pub fn mult(&mut self, factor: f64) {
        let product = (self.value as f64 * factor).round() as i64;
        self.update(product.clamp(self.bottom, self.top));
    }

    /// Consume the changed flag, returning whether any mutation since the
    /// last call altered the value.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    fn update(&mut self, next: i64) {
        if next != self.value {
            self.value = next;
            self.changed = true;
        }
    }
}
