//! Mechanical WSDL generation for the NoteReader service.
//!
//! The generated document advertises one document/literal operation per
//! registered method, each taking and returning a single `document` string
//! element. It aims for schema validity, not fidelity to any vendor WSDL.

/// Target namespace of the generated service description.
const TARGET_NS: &str = "urn:carebridge:notereader";

pub fn generate_wsdl(service_name: &str, methods: &[&str]) -> String {
    let mut schema_elements = String::new();
    let mut messages = String::new();
    let mut port_operations = String::new();
    let mut binding_operations = String::new();

    for method in methods {
        schema_elements.push_str(&format!(
            "      <xsd:element name=\"{method}\">\n\
             \x20       <xsd:complexType><xsd:sequence>\n\
             \x20         <xsd:element name=\"document\" type=\"xsd:string\"/>\n\
             \x20       </xsd:sequence></xsd:complexType>\n\
             \x20     </xsd:element>\n\
             \x20     <xsd:element name=\"{method}Response\">\n\
             \x20       <xsd:complexType><xsd:sequence>\n\
             \x20         <xsd:element name=\"document\" type=\"xsd:string\"/>\n\
             \x20       </xsd:sequence></xsd:complexType>\n\
             \x20     </xsd:element>\n"
        ));

        messages.push_str(&format!(
            "  <wsdl:message name=\"{method}Request\">\n\
             \x20   <wsdl:part name=\"parameters\" element=\"tns:{method}\"/>\n\
             \x20 </wsdl:message>\n\
             \x20 <wsdl:message name=\"{method}ResponseMessage\">\n\
             \x20   <wsdl:part name=\"parameters\" element=\"tns:{method}Response\"/>\n\
             \x20 </wsdl:message>\n"
        ));

        port_operations.push_str(&format!(
            "    <wsdl:operation name=\"{method}\">\n\
             \x20     <wsdl:input message=\"tns:{method}Request\"/>\n\
             \x20     <wsdl:output message=\"tns:{method}ResponseMessage\"/>\n\
             \x20   </wsdl:operation>\n"
        ));

        binding_operations.push_str(&format!(
            "    <wsdl:operation name=\"{method}\">\n\
             \x20     <soap:operation soapAction=\"{TARGET_NS}#{method}\"/>\n\
             \x20     <wsdl:input><soap:body use=\"literal\"/></wsdl:input>\n\
             \x20     <wsdl:output><soap:body use=\"literal\"/></wsdl:output>\n\
             \x20   </wsdl:operation>\n"
        ));
    }

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <wsdl:definitions name=\"{service_name}\"\n\
         \x20   targetNamespace=\"{TARGET_NS}\"\n\
         \x20   xmlns:wsdl=\"http://schemas.xmlsoap.org/wsdl/\"\n\
         \x20   xmlns:soap=\"http://schemas.xmlsoap.org/wsdl/soap/\"\n\
         \x20   xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\"\n\
         \x20   xmlns:tns=\"{TARGET_NS}\">\n\
         \x20 <wsdl:types>\n\
         \x20   <xsd:schema targetNamespace=\"{TARGET_NS}\" elementFormDefault=\"qualified\">\n\
         {schema_elements}\
         \x20   </xsd:schema>\n\
         \x20 </wsdl:types>\n\
         {messages}\
         \x20 <wsdl:portType name=\"{service_name}PortType\">\n\
         {port_operations}\
         \x20 </wsdl:portType>\n\
         \x20 <wsdl:binding name=\"{service_name}Binding\" type=\"tns:{service_name}PortType\">\n\
         \x20   <soap:binding style=\"document\" transport=\"http://schemas.xmlsoap.org/soap/http\"/>\n\
         {binding_operations}\
         \x20 </wsdl:binding>\n\
         \x20 <wsdl:service name=\"{service_name}\">\n\
         \x20   <wsdl:port name=\"{service_name}Port\" binding=\"tns:{service_name}Binding\">\n\
         \x20     <soap:address location=\"/\"/>\n\
         \x20   </wsdl:port>\n\
         \x20 </wsdl:service>\n\
         </wsdl:definitions>\n"
    )
}
