//! Connect-retry spinner
//!
//! Small owned TTY artifact the setup path constructs and ticks while a
//! proxy connect keeps timing out.

use std::io::{self, Write};

const GLYPHS: [char; 4] = ['|', '/', '-', '\\'];

pub(crate) struct Spinner {
    frame: Option<usize>,
    enabled: bool,
}

impl Spinner {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            frame: None,
            enabled,
        }
    }

    /// Advance one frame, erasing the previous glyph
    pub(crate) fn tick(&mut self) {
        if !self.enabled {
            return;
        }
        let next = match self.frame {
            Some(current) => {
                print!("\x08");
                (current + 1) % GLYPHS.len()
            }
            None => 0,
        };
        print!("{}", GLYPHS[next]);
        let _ = io::stdout().flush();
        self.frame = Some(next);
    }

    /// Erase the glyph once the retry loop is done
    pub(crate) fn finish(&mut self) {
        if self.frame.take().is_some() && self.enabled {
            print!("\x08 \x08");
            let _ = io::stdout().flush();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.finish();
    }
}
