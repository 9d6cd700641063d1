//! PKCS#11 driver access through cryptoki

use std::cell::RefCell;
use std::path::Path;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::Session;
use cryptoki::slot::Slot;

use crate::error::InspectError;
use crate::monitor::inspector::{DriverModule, DriverSession, ObjectId, ObjectKind, SlotId, SlotToken, SmartcardDriver};

/// Loads vendor PKCS#11 libraries
#[derive(Debug, Default, Clone, Copy)]
pub struct Pkcs11Driver;

impl SmartcardDriver for Pkcs11Driver {
    fn load(&self, library: &Path) -> Result<Box<dyn DriverModule>, InspectError> {
        let context = Pkcs11::new(library)
            .map_err(|e| InspectError::session(format!("failed to load {}: {}", library.display(), e)))?;
        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| InspectError::session(format!("C_Initialize failed: {}", e)))?;

        let slots = context
            .get_slots_with_token()
            .map_err(|e| InspectError::session(format!("C_GetSlotList failed: {}", e)))?;

        Ok(Box::new(Pkcs11Module { context, slots }))
    }
}

/// An initialized library. Finalized when the context is dropped.
struct Pkcs11Module {
    context: Pkcs11,
    slots: Vec<Slot>,
}

impl Pkcs11Module {
    fn slot(&self, slot: SlotId) -> Result<Slot, InspectError> {
        self.slots
            .get(slot)
            .copied()
            .ok_or_else(|| InspectError::session(format!("slot index {} out of range", slot)))
    }
}

impl DriverModule for Pkcs11Module {
    fn tokens(&self) -> Result<Vec<SlotToken>, InspectError> {
        let mut tokens = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.iter().enumerate() {
            let info = self
                .context
                .get_token_info(*slot)
                .map_err(|e| InspectError::session(format!("C_GetTokenInfo failed: {}", e)))?;
            tokens.push(SlotToken {
                slot: index,
                label: info.label().to_string(),
                manufacturer: info.manufacturer_id().to_string(),
                model: info.model().to_string(),
                serial_number: info.serial_number().to_string(),
            });
        }
        Ok(tokens)
    }

    fn open_session(&self, slot: SlotId) -> Result<Box<dyn DriverSession + '_>, InspectError> {
        let session = self
            .context
            .open_ro_session(self.slot(slot)?)
            .map_err(|e| InspectError::session(format!("C_OpenSession failed: {}", e)))?;
        Ok(Box::new(Pkcs11Session {
            session,
            found: RefCell::new(Vec::new()),
        }))
    }
}

/// Read-only session; cryptoki closes it on drop
struct Pkcs11Session {
    session: Session,
    found: RefCell<Vec<ObjectHandle>>,
}

impl DriverSession for Pkcs11Session {
    fn find_objects(&self, kind: ObjectKind, limit: usize) -> Result<Vec<ObjectId>, InspectError> {
        let class = match kind {
            ObjectKind::Certificate => ObjectClass::CERTIFICATE,
        };
        let mut handles = self
            .session
            .find_objects(&[Attribute::Class(class)])
            .map_err(|e| InspectError::session(format!("C_FindObjects failed: {}", e)))?;
        handles.truncate(limit);

        let ids = (0..handles.len()).collect();
        *self.found.borrow_mut() = handles;
        Ok(ids)
    }

    fn value(&self, object: ObjectId) -> Result<Vec<u8>, InspectError> {
        let handle = self
            .found
            .borrow()
            .get(object)
            .copied()
            .ok_or_else(|| InspectError::session(format!("object index {} out of range", object)))?;

        let attributes = self
            .session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(|e| InspectError::session(format!("C_GetAttributeValue failed: {}", e)))?;

        attributes
            .into_iter()
            .find_map(|attribute| match attribute {
                Attribute::Value(bytes) => Some(bytes),
                _ => None,
            })
            .ok_or_else(|| InspectError::session("certificate object has no value"))
    }
}
