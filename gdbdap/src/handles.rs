/// Integer handles handed to the client for frames and variable containers
///
/// Handles stay valid until the next `reset`, which happens whenever the
/// target resumes.

use std::collections::HashMap;

const FIRST_HANDLE: i64 = 1000;

#[derive(Debug)]
pub struct Handles<T> {
    values: HashMap<i64, T>,
    next: i64,
}

impl<T> Default for Handles<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Handles<T> {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            next: FIRST_HANDLE,
        }
    }

    pub fn create(&mut self, value: T) -> i64 {
        self.next += 1;
        self.values.insert(self.next, value);
        self.next
    }

    pub fn get(&self, handle: i64) -> Option<&T> {
        self.values.get(&handle)
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}
