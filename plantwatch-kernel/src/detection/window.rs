use std::collections::VecDeque;

/// Capacité de la fenêtre glissante par capteur
pub const WINDOW_CAPACITY: usize = 60;

/// Tampon circulaire des dernières valeurs d'un capteur (éviction O(1))
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { values: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    /// Copie ordonnée, de la plus ancienne à la plus récente
    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(WINDOW_CAPACITY)
    }
}
