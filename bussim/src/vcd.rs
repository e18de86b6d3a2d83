// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::sim::Time;
use bitvec::prelude::*;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;

pub const DEFAULT_TOP_MODULE: &str = "bussim";
const DEFAULT_VCD_HEADER: &str = "bussim VCD";

#[derive(Clone, Debug, PartialEq)]
enum SizedData {
    Filled(BitVec<u8, Lsb0>),
    Undefined(usize),
}

#[derive(Clone, Copy, Debug)]
struct Signal {
    id_code: vcd::IdCode,
    width: usize,
}

/// Writes a value change dump of simulation signals.
///
/// Signals are declared under nested module scopes while the header is
/// written, and changed under the same scopes afterwards. The first write
/// error is logged and further output is suppressed.
pub struct VcdWriter {
    writer: vcd::Writer<Box<dyn io::Write>>,
    is_error_state: bool,
    scope_stack: Vec<String>,
    id_map: HashMap<String, Signal>,
    last_value_map: HashMap<vcd::IdCode, SizedData>,
    deferred_changes: HashMap<vcd::IdCode, SizedData>,
    timestamp: Option<Time>,
}

pub struct VcdTraceScope {
    writer: Rc<RefCell<VcdWriter>>,
    scope: String,
}

impl Drop for VcdTraceScope {
    fn drop(&mut self) {
        self.writer.borrow_mut().leave_scope(self.scope.as_str());
    }
}

pub struct VcdDeclScope {
    writer: Rc<RefCell<VcdWriter>>,
    scope: String,
}

impl Drop for VcdDeclScope {
    fn drop(&mut self) {
        self.writer.borrow_mut().upscope(self.scope.as_str());
    }
}

fn timescale_for(time_resolution_ps: u64) -> (u32, vcd::TimescaleUnit) {
    let units = [
        (1_000_000_000_000, vcd::TimescaleUnit::S),
        (1_000_000_000, vcd::TimescaleUnit::MS),
        (1_000_000, vcd::TimescaleUnit::US),
        (1_000, vcd::TimescaleUnit::NS),
    ];
    for (scale, unit) in units {
        if time_resolution_ps >= scale && time_resolution_ps % scale == 0 {
            return ((time_resolution_ps / scale) as u32, unit);
        }
    }
    (time_resolution_ps.max(1) as u32, vcd::TimescaleUnit::PS)
}

impl VcdWriter {
    pub fn new(dst: Box<dyn io::Write>) -> Self {
        Self {
            writer: vcd::Writer::new(dst),
            is_error_state: false,
            scope_stack: vec![],
            id_map: HashMap::new(),
            last_value_map: HashMap::new(),
            deferred_changes: HashMap::new(),
            timestamp: None,
        }
    }

    pub fn create<P: AsRef<Path>>(dst: P) -> io::Result<Self> {
        let file = fs::File::create(dst.as_ref())?;
        log::debug!("VCD file: {}", dst.as_ref().display());
        Ok(Self::new(Box::new(io::BufWriter::new(file))))
    }

    fn vcd_error_handler(&mut self, err: io::Error) {
        if !self.is_error_state {
            self.is_error_state = true;
            log::error!("VCD writing failed with error {:?}", err)
        }
    }

    pub fn is_error_state(&self) -> bool {
        self.is_error_state
    }

    pub fn managed_decl_scope<T>(writer: Rc<RefCell<VcdWriter>>, scope: &T) -> VcdDeclScope
    where
        T: Display + ?Sized,
    {
        writer.borrow_mut().add_module(scope);
        VcdDeclScope {
            writer: Rc::clone(&writer),
            scope: scope.to_string(),
        }
    }

    pub fn managed_trace_scope<T>(writer: Rc<RefCell<VcdWriter>>, scope: &T) -> VcdTraceScope
    where
        T: Display + ?Sized,
    {
        writer.borrow_mut().enter_scope(scope);
        VcdTraceScope {
            writer: Rc::clone(&writer),
            scope: scope.to_string(),
        }
    }

    /// Declares the signals of every component and records their initial
    /// values at time zero.
    pub fn write_header(
        writer: Rc<RefCell<Self>>,
        time_resolution_ps: u64,
        components: &[&dyn VcdComponent],
    ) {
        let (scale, unit) = timescale_for(time_resolution_ps);
        writer.borrow_mut().with_writer(|w| {
            w.comment(DEFAULT_VCD_HEADER)?;
            w.date(chrono::Utc::now().to_string().as_str())?;
            w.timescale(scale, unit)
        });
        {
            let _vcd_decl_scope =
                VcdWriter::managed_decl_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
            for component in components {
                component.vcd_write_scope(Rc::clone(&writer));
            }
        }
        writer.borrow_mut().with_writer(|w| w.enddefinitions());
        {
            let _vcd_trace_scope =
                VcdWriter::managed_trace_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
            writer.borrow_mut().enter_time(0);
            for component in components {
                component.vcd_init(Rc::clone(&writer));
            }
        }
    }

    fn with_writer<F>(&mut self, f: F)
    where
        F: FnOnce(&mut vcd::Writer<Box<dyn io::Write>>) -> io::Result<()>,
    {
        if self.is_error_state {
            return;
        }
        f(&mut self.writer).unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn enter_scope<T: Display + ?Sized>(&mut self, name: &T) {
        self.scope_stack.push(name.to_string())
    }

    fn leave_scope<T: Display + ?Sized>(&mut self, scope: &T) {
        match self.scope_stack.pop() {
            Some(popped) if popped == scope.to_string() => {}
            popped => log::error!("VCD scope mismatch: left {} but was in {:?}", scope, popped),
        }
    }

    fn record_change(&mut self, id_code: vcd::IdCode, sized_data: &SizedData) {
        if self.is_error_state {
            return;
        }
        self._record_change(id_code, sized_data)
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn _record_change(&mut self, id_code: vcd::IdCode, sized_data: &SizedData) -> io::Result<()> {
        if let Some(last_sized_data) = self.last_value_map.get(&id_code) {
            if last_sized_data == sized_data {
                return Ok(());
            }
        }
        match sized_data {
            SizedData::Filled(data) => self.writer.change_vector(
                id_code,
                data.iter()
                    .rev()
                    .map(|b| (*b).into())
                    .collect::<Vec<_>>()
                    .as_slice(),
            )?,
            SizedData::Undefined(size) => self.writer.change_vector(
                id_code,
                (0..*size)
                    .map(|_| vcd::Value::X)
                    .collect::<Vec<_>>()
                    .as_slice(),
            )?,
        };
        self.last_value_map.insert(id_code, sized_data.clone());
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<Signal> {
        let scoped_name = self.scoped_name(name);
        let signal = self.id_map.get(scoped_name.as_str()).copied();
        if signal.is_none() {
            log::warn!(
                "No such scoped name {} was defined for VCD dumps.",
                scoped_name
            );
        } else if cfg!(feature = "trace-echo-vcd-signal-changes") {
            log::trace!("VCD changing {}", scoped_name);
        }
        signal
    }

    fn sized(value: u64, width: usize) -> SizedData {
        let mut bits = BitVec::<u8, Lsb0>::repeat(false, width);
        for (i, mut bit) in bits.iter_mut().enumerate().take(64) {
            *bit = (value >> i) & 1 == 1;
        }
        SizedData::Filled(bits)
    }

    /// Records `value` for `name`; it appears at the next timestamp.
    pub fn change_vector(&mut self, name: &str, value: u64) {
        if let Some(signal) = self.lookup(name) {
            self.deferred_changes
                .insert(signal.id_code, Self::sized(value, signal.width));
        }
    }

    /// Records `value` for `name` at the current timestamp.
    pub fn change_vector_immediately(&mut self, name: &str, value: u64) {
        if let Some(signal) = self.lookup(name) {
            self.deferred_changes.remove(&signal.id_code);
            self.record_change(signal.id_code, &Self::sized(value, signal.width));
        }
    }

    pub fn change_undefined_immediately(&mut self, name: &str) {
        if let Some(signal) = self.lookup(name) {
            self.deferred_changes.remove(&signal.id_code);
            self.record_change(signal.id_code, &SizedData::Undefined(signal.width));
        }
    }

    /// Starts a new timestamp at `time` and writes the deferred changes into
    /// it. Calls at the current timestamp are no-ops.
    pub fn enter_time(&mut self, time: Time) {
        if self.is_error_state || self.timestamp.map_or(false, |t| time <= t) {
            return;
        }
        self._enter_time(time)
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn _enter_time(&mut self, time: Time) -> io::Result<()> {
        self.writer.timestamp(time)?;
        self.timestamp = Some(time);
        let deferred_changes: HashMap<vcd::IdCode, SizedData> =
            self.deferred_changes.drain().collect();
        for (id_code, data) in deferred_changes {
            self._record_change(id_code, &data)?;
        }
        Ok(())
    }

    /// Writes the pending changes at `time`, or one time unit after the last
    /// timestamp if that is later.
    pub fn flush_after_simulation(&mut self, time: Time) {
        if !self.deferred_changes.is_empty() {
            let at = self.timestamp.map_or(time, |t| time.max(t + 1));
            self.enter_time(at);
        }
    }

    fn add_module<T: Display + ?Sized>(&mut self, name: &T) {
        self.scope_stack.push(name.to_string());
        self.with_writer(|w| w.add_module(&name.to_string()));
    }

    fn upscope<T: Display + ?Sized>(&mut self, scope: &T) {
        self.leave_scope(scope);
        self.with_writer(|w| w.upscope());
    }

    pub fn add_integer_var<T: Sized>(&mut self, reference: &str) {
        self.add_var(
            vcd::VarType::Integer,
            std::mem::size_of::<T>() * 8,
            reference,
            None,
        );
    }

    pub fn add_wire(&mut self, width: usize, reference: &str) {
        self.add_var(vcd::VarType::Wire, width, reference, None);
    }

    pub fn add_var(
        &mut self,
        var_type: vcd::VarType,
        width: usize,
        reference: &str,
        index: Option<vcd::ReferenceIndex>,
    ) {
        if self.is_error_state {
            return;
        }
        match self
            .writer
            .add_var(var_type, width as u32, &reference.to_string(), index)
        {
            Ok(id_code) => self.add_id_map(reference, Signal { id_code, width }),
            Err(err) => self.vcd_error_handler(err),
        }
    }

    fn scoped_name(&self, name: &str) -> String {
        self.scope_stack.join(".") + "." + name
    }

    fn add_id_map(&mut self, name: &str, signal: Signal) {
        let scoped_name = self.scoped_name(name);
        if self.id_map.contains_key(scoped_name.as_str()) {
            log::warn!("Scoped name {} was redefined for VCD dumps.", scoped_name);
        }
        self.id_map.insert(scoped_name, signal);
    }
}

/// Something that declares signals in a VCD header and records their
/// initial values.
///
/// Implementations open their own scope with
/// `VcdWriter::managed_decl_scope` in `vcd_write_scope` and with
/// `VcdWriter::managed_trace_scope` in `vcd_init`, so that the signal "x"
/// of a component named "a" becomes "bussim.a.x".
pub trait VcdComponent {
    fn vcd_write_scope(&self, vcd_writer: Rc<RefCell<VcdWriter>>);

    fn vcd_init(&self, vcd_writer: Rc<RefCell<VcdWriter>>);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// An in-memory sink whose contents stay readable after the writer
    /// takes ownership of a clone.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Rc<RefCell<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        pub(crate) fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    struct Counter;

    impl VcdComponent for Counter {
        fn vcd_write_scope(&self, writer: Rc<RefCell<VcdWriter>>) {
            let _scope = VcdWriter::managed_decl_scope(Rc::clone(&writer), "counter");
            writer.borrow_mut().add_wire(4, "count");
            writer.borrow_mut().add_wire(1, "valid");
        }
        fn vcd_init(&self, writer: Rc<RefCell<VcdWriter>>) {
            let _scope = VcdWriter::managed_trace_scope(Rc::clone(&writer), "counter");
            writer.borrow_mut().change_vector_immediately("count", 0);
            writer.borrow_mut().change_undefined_immediately("valid");
        }
    }

    #[test]
    fn test_header_and_changes() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let buffer = SharedBuffer::default();
        let writer = Rc::new(RefCell::new(VcdWriter::new(Box::new(buffer.clone()))));
        VcdWriter::write_header(Rc::clone(&writer), 1000, &[&Counter]);
        {
            let _top = VcdWriter::managed_trace_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
            let _scope = VcdWriter::managed_trace_scope(Rc::clone(&writer), "counter");
            let mut w = writer.borrow_mut();
            w.enter_time(1000);
            w.change_vector_immediately("count", 5);
            w.change_vector_immediately("valid", 1);
            w.change_vector("valid", 0);
            // Unchanged values are not repeated.
            w.change_vector_immediately("count", 5);
            w.enter_time(2000);
        }
        writer.borrow_mut().flush_after_simulation(2000);
        assert!(!writer.borrow().is_error_state());
        let text = buffer.text();
        assert!(text.contains("$timescale"), "{}", text);
        assert!(text.contains(" ns "));
        assert!(text.contains("$scope module counter $end"));
        assert!(text.contains("#1000"));
        assert!(text.contains("b0101 "));
        assert_eq!(text.matches("b0101 ").count(), 1);
        assert!(text.contains("#2000"));
        assert!(text.contains("bx "));
    }

    #[test]
    fn test_unknown_signal_is_ignored() {
        let buffer = SharedBuffer::default();
        let writer = Rc::new(RefCell::new(VcdWriter::new(Box::new(buffer.clone()))));
        VcdWriter::write_header(Rc::clone(&writer), 1, &[&Counter]);
        writer.borrow_mut().change_vector_immediately("nonexistent", 1);
        assert!(!writer.borrow().is_error_state());
        assert!(buffer.text().contains(" ps "));
    }

    #[test]
    fn test_timescale_units() {
        assert!(matches!(timescale_for(1), (1, vcd::TimescaleUnit::PS)));
        assert!(matches!(timescale_for(10_000), (10, vcd::TimescaleUnit::NS)));
        assert!(matches!(timescale_for(2_000_000), (2, vcd::TimescaleUnit::US)));
        assert!(matches!(timescale_for(1500), (1500, vcd::TimescaleUnit::PS)));
    }
}
