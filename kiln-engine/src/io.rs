use indexmap::IndexMap;

use kiln_device::device::{Device, DeviceBuffer};
use kiln_device::error::TransferError;
use kiln_graph::dtype::DTensor;

use crate::context::ExecutionContext;
use crate::error::{BindingError, KilnError};
use crate::runtime::TensorIoMode;

/// A host tensor and a device buffer of the same size, for every I/O tensor of an engine.
///
/// Sizes are taken from the concrete shapes of the context the buffers were allocated for.
#[derive(Debug)]
pub struct IoBuffers {
    entries: IndexMap<String, IoEntry>,
}

#[derive(Debug)]
pub struct IoEntry {
    pub mode: TensorIoMode,
    pub host: DTensor,
    pub device: DeviceBuffer,
}

impl IoBuffers {
    pub fn allocate(device: &Device, context: &ExecutionContext) -> Result<IoBuffers, KilnError> {
        let mut entries = IndexMap::new();

        for tensor in context.engine().io_tensors() {
            let shape = context.tensor_shape(&tensor.name)?;
            let host = DTensor::zeros(tensor.dtype, &shape);
            let buffer = device.alloc(host.size_bytes())?;

            tracing::trace!(
                "Allocated {} buffer {:?} of {} bytes at {}",
                tensor.mode,
                tensor.name,
                buffer.len_bytes(),
                buffer.ptr()
            );
            entries.insert(
                tensor.name,
                IoEntry {
                    mode: tensor.mode,
                    host,
                    device: buffer,
                },
            );
        }

        Ok(IoBuffers { entries })
    }

    /// Replace the host data of an input. The dtype and shape must match the allocated buffer.
    pub fn set_host_input(&mut self, name: &str, value: DTensor) -> Result<(), KilnError> {
        let entry = match self.entries.get_mut(name) {
            Some(entry) if entry.mode == TensorIoMode::Input => entry,
            Some(_) => return Err(BindingError::NotAnInput(name.to_owned()).into()),
            None => return Err(BindingError::UnknownTensor(name.to_owned()).into()),
        };
        if value.dtype() != entry.host.dtype() || value.shape() != entry.host.shape() {
            return Err(KilnError::Transfer(TransferError::SizeMismatch {
                name: name.to_owned(),
                expected: format!("{} {}", entry.host.dtype(), entry.host.concrete_shape()),
                actual: format!("{} {}", value.dtype(), value.concrete_shape()),
            }));
        }
        entry.host = value;
        Ok(())
    }

    /// Copy the host data of every input to its device buffer.
    pub fn upload_inputs(&self) -> Result<(), TransferError> {
        for entry in self.entries.values().filter(|e| e.mode == TensorIoMode::Input) {
            entry.device.copy_from_host(&entry.host.to_bytes())?;
        }
        Ok(())
    }

    /// Bind the device buffers as the addresses of the I/O tensors of `context`.
    pub fn bind(&self, context: &mut ExecutionContext) -> Result<(), KilnError> {
        for (name, entry) in &self.entries {
            context.set_tensor_address(name, entry.device.ptr())?;
        }
        Ok(())
    }

    /// Copy every output back from its device buffer to the host.
    pub fn download_outputs(&mut self) -> Result<(), TransferError> {
        for (name, entry) in self.entries.iter_mut().filter(|(_, e)| e.mode == TensorIoMode::Output) {
            let mut bytes = vec![0; entry.host.size_bytes()];
            entry.device.copy_to_host(&mut bytes)?;
            entry.host = DTensor::from_bytes(entry.host.dtype(), &entry.host.concrete_shape(), &bytes).map_err(|e| {
                TransferError::SizeMismatch {
                    name: name.clone(),
                    expected: e.expected.to_string(),
                    actual: e.actual.to_string(),
                }
            })?;
        }
        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<&DTensor> {
        self.entries.get(name).map(|e| &e.host)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &IoEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Host values of all outputs, in engine order.
    pub fn outputs(&self) -> Vec<DTensor> {
        self.entries
            .values()
            .filter(|e| e.mode == TensorIoMode::Output)
            .map(|e| e.host.clone())
            .collect()
    }

    /// Release the device buffers, reporting the first failure.
    pub fn free(self) -> Result<(), KilnError> {
        let mut result = Ok(());
        for (_, entry) in self.entries {
            let freed = entry.device.free();
            if result.is_ok() {
                result = freed;
            }
        }
        Ok(result?)
    }
}
