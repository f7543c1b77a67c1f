use std::cell::RefCell;
use std::io::{self, BufRead, IsTerminal, Write};
use std::rc::Rc;

/// Streams the builtins talk to.
pub struct VmIo {
    pub out: Box<dyn Write>,
    pub err: Box<dyn Write>,
    pub input: Box<dyn BufRead>,
    /// Both stdin and stdout are terminals; enables the `input> ` prompt.
    pub interactive: bool,
}

impl VmIo {
    pub fn stdio() -> Self {
        let interactive = io::stdin().is_terminal() && io::stdout().is_terminal();
        VmIo {
            out: Box::new(io::stdout()),
            err: Box::new(io::stderr()),
            input: Box::new(io::BufReader::new(io::stdin())),
            interactive,
        }
    }

    /// Captured output and canned input, for embedding and tests.
    pub fn captured(input: &str) -> (Self, SharedBuffer, SharedBuffer) {
        let out = SharedBuffer::default();
        let err = SharedBuffer::default();
        let io = VmIo {
            out: Box::new(out.clone()),
            err: Box::new(err.clone()),
            input: Box::new(io::Cursor::new(input.as_bytes().to_vec())),
            interactive: false,
        };
        (io, out, err)
    }
}

/// A cloneable in-memory writer; every clone appends to the same bytes.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
